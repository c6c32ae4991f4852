//! Live scheduling interface.
//!
//! A strategy desk runs the configured strategies inside a tokio task. Callers
//! drive it with [`DeskCommand`]s and read [`DeskEvent`]s back; periodic
//! timers created with [`spawn_timer`] feed it independently, one for signal
//! evaluation and one for position monitoring. Order routing is left to the
//! consumer of the events.

use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backtest::engine::fresh_mark;
use crate::backtest::{ExitReason, MarkSource, Position, PositionId};
use crate::data::{sanitize_snapshot, MarketSnapshot};
use crate::error::{DataQualityIssue, DataQualityLog};
use crate::pricing::{BlackScholes, PricedSnapshot};
use crate::strategy::{EntryProposal, OptionsStrategy, Signal, Strategy, StrategyKind};

#[derive(Debug, Clone)]
pub struct DeskConfig {
    pub risk_free_rate: f64,
    pub evaluate_interval: Duration,
    pub monitor_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.07,
            evaluate_interval: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(30),
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeskCommand {
    /// Look for entries on this snapshot.
    Evaluate(MarketSnapshot),
    /// Check the given open positions for exits.
    Monitor(MarketSnapshot, Vec<Position>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeskEvent {
    Entry {
        strategy: StrategyKind,
        timestamp: NaiveDateTime,
        proposal: EntryProposal,
    },
    Exit {
        strategy: StrategyKind,
        timestamp: NaiveDateTime,
        position_id: PositionId,
        reason: ExitReason,
        detail: String,
    },
    DataQuality(DataQualityIssue),
    /// The snapshot could not be used at all.
    Rejected {
        timestamp: NaiveDateTime,
        detail: String,
    },
    Stopped,
}

/// Handle to a running desk.
pub struct StrategyDesk {
    pub commands: mpsc::Sender<DeskCommand>,
    pub events: mpsc::Receiver<DeskEvent>,
    /// Resolves to the number of commands handled.
    pub task: JoinHandle<usize>,
}

struct Desk {
    strategies: Vec<Strategy>,
    model: BlackScholes,
    /// Positions from the latest `Monitor`, used for capacity checks.
    open: Vec<Position>,
    events: mpsc::Sender<DeskEvent>,
}

impl Desk {
    fn price(&self, snapshot: MarketSnapshot) -> (Option<PricedSnapshot>, Vec<DeskEvent>) {
        let timestamp = snapshot.timestamp;
        let mut log = DataQualityLog::new();
        let (snapshot, report) = match sanitize_snapshot(snapshot) {
            Ok(checked) => checked,
            Err(e) => {
                return (
                    None,
                    vec![DeskEvent::Rejected {
                        timestamp,
                        detail: e.to_string(),
                    }],
                )
            }
        };
        for (contract, defect) in &report.dropped {
            log.record(DataQualityIssue::DataUnavailable {
                timestamp: Some(timestamp),
                detail: format!("{} dropped: {}", contract, defect.describe()),
            });
        }
        let priced = PricedSnapshot::build(snapshot, self.model, &mut log);
        let events = log.issues().iter().cloned().map(DeskEvent::DataQuality).collect();
        (Some(priced), events)
    }

    fn evaluate(&mut self, snapshot: MarketSnapshot) -> Vec<DeskEvent> {
        let (priced, mut events) = self.price(snapshot);
        let Some(priced) = priced else {
            return events;
        };
        let open: Vec<&Position> = self.open.iter().filter(|p| p.is_open()).collect();

        for strategy in &mut self.strategies {
            strategy.observe(&priced);
        }
        for strategy in &self.strategies {
            let Signal::Enter(proposal) = strategy.evaluate(&priced, &open) else {
                continue;
            };
            let kind = strategy.kind();
            match proposal.validate(&strategy.leg_ratio()) {
                Ok(()) => {
                    debug!(strategy = %kind, legs = proposal.legs.len(), "entry signal");
                    events.push(DeskEvent::Entry {
                        strategy: kind,
                        timestamp: priced.timestamp(),
                        proposal,
                    });
                }
                Err(e) => events.push(DeskEvent::DataQuality(DataQualityIssue::SignalRejected {
                    timestamp: priced.timestamp(),
                    strategy: kind.to_string(),
                    detail: e.to_string(),
                })),
            }
        }
        events
    }

    fn monitor(&mut self, snapshot: MarketSnapshot, mut positions: Vec<Position>) -> Vec<DeskEvent> {
        let (priced, mut events) = self.price(snapshot);
        let Some(priced) = priced else {
            self.open = positions;
            return events;
        };

        for position in positions
            .iter_mut()
            .filter(|p| p.is_open() && p.underlying == priced.underlying())
        {
            for leg in &mut position.legs {
                if let Some((mark, iv)) = fresh_mark(&priced, leg) {
                    leg.set_mark(mark, MarkSource::Quote);
                    if let Some(iv) = iv {
                        leg.mark_iv = iv;
                    }
                }
            }

            let Some(strategy) = self.strategies.iter().find(|s| s.kind() == position.strategy) else {
                continue;
            };
            if let Signal::Exit {
                position_id,
                reason,
                detail,
            } = strategy.exit_check(position, &priced)
            {
                debug!(position = position_id, %reason, "exit signal");
                events.push(DeskEvent::Exit {
                    strategy: position.strategy,
                    timestamp: priced.timestamp(),
                    position_id,
                    reason,
                    detail,
                });
            }
        }
        self.open = positions;
        events
    }

    async fn run(mut self, mut commands: mpsc::Receiver<DeskCommand>) -> usize {
        let mut handled = 0;
        while let Some(command) = commands.recv().await {
            handled += 1;
            let events = match command {
                DeskCommand::Evaluate(snapshot) => self.evaluate(snapshot),
                DeskCommand::Monitor(snapshot, positions) => self.monitor(snapshot, positions),
                DeskCommand::Shutdown => break,
            };
            for event in events {
                if self.events.send(event).await.is_err() {
                    warn!("event receiver dropped, stopping desk");
                    return handled;
                }
            }
        }
        let _ = self.events.send(DeskEvent::Stopped).await;
        info!(commands = handled, "strategy desk stopped");
        handled
    }
}

/// Start a desk for `strategies`. It stops on [`DeskCommand::Shutdown`] or
/// once every command sender is dropped.
pub fn spawn_strategy_desk(strategies: Vec<Strategy>, config: DeskConfig) -> StrategyDesk {
    let capacity = config.channel_capacity.max(1);
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);

    info!(
        strategies = ?strategies.iter().map(Strategy::name).collect::<Vec<_>>(),
        "strategy desk started"
    );
    let desk = Desk {
        strategies,
        model: BlackScholes::with_rate(config.risk_free_rate),
        open: Vec::new(),
        events: event_tx,
    };
    let task = tokio::spawn(desk.run(command_rx));

    StrategyDesk {
        commands: command_tx,
        events: event_rx,
        task,
    }
}

/// Every `period`, ask `feed` for a command and forward it to the desk.
///
/// `feed` returning `None` skips that tick. Aborting the returned handle stops
/// future ticks; a command already handed to the desk still runs.
pub fn spawn_timer<F>(period: Duration, commands: mpsc::Sender<DeskCommand>, mut feed: F) -> JoinHandle<()>
where
    F: FnMut() -> Option<DeskCommand> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(command) = feed() else {
                continue;
            };
            if commands.send(command).await.is_err() {
                debug!("desk closed, timer exiting");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{LegSide, OptionLeg};
    use crate::data::OptionRight;
    use crate::strategy::test_support::{chain_snapshot, timestamp};
    use crate::strategy::{PremiumSelling, PremiumSellingConfig};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn seeded() -> Vec<Strategy> {
        let mut strategy = PremiumSelling::new(PremiumSellingConfig::default());
        let mut history = vec![0.12; 39];
        history.push(0.20);
        strategy.initialize(&history);
        vec![Strategy::PremiumSelling(strategy)]
    }

    fn entry_snapshot() -> MarketSnapshot {
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        chain_snapshot(timestamp(2024, 1, 2), 21500.0, 0.20, &[expiry], 50, 40)
    }

    fn strangle() -> Position {
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let legs = vec![
            OptionLeg::new(dec!(22500), expiry, OptionRight::Call, LegSide::Short, 1, dec!(80)),
            OptionLeg::new(dec!(20500), expiry, OptionRight::Put, LegSide::Short, 1, dec!(70)),
        ];
        let mut position = Position::new(7, StrategyKind::PremiumSelling, "NIFTY", legs, timestamp(2024, 1, 2), 1, 50);
        position.fill().unwrap();
        position
    }

    async fn next_non_quality(events: &mut mpsc::Receiver<DeskEvent>) -> Option<DeskEvent> {
        while let Some(event) = events.recv().await {
            if !matches!(event, DeskEvent::DataQuality(_)) {
                return Some(event);
            }
        }
        None
    }

    #[tokio::test]
    async fn test_evaluate_emits_entry() {
        let mut desk = spawn_strategy_desk(seeded(), DeskConfig::default());
        desk.commands.send(DeskCommand::Evaluate(entry_snapshot())).await.unwrap();

        let Some(DeskEvent::Entry { strategy, proposal, .. }) = next_non_quality(&mut desk.events).await else {
            panic!("expected an entry");
        };
        assert_eq!(strategy, StrategyKind::PremiumSelling);
        assert_eq!(proposal.legs.len(), 2);

        desk.commands.send(DeskCommand::Shutdown).await.unwrap();
        assert_eq!(next_non_quality(&mut desk.events).await, Some(DeskEvent::Stopped));
        assert_eq!(desk.task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_monitor_refreshes_marks_before_exit_check() {
        let mut desk = spawn_strategy_desk(seeded(), DeskConfig::default());
        // Two days to expiry: both wings are nearly worthless.
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let snapshot = chain_snapshot(timestamp(2024, 2, 27), 21500.0, 0.15, &[expiry], 100, 10);
        desk.commands
            .send(DeskCommand::Monitor(snapshot, vec![strangle()]))
            .await
            .unwrap();

        match next_non_quality(&mut desk.events).await {
            Some(DeskEvent::Exit {
                position_id, reason, ..
            }) => {
                assert_eq!(position_id, 7);
                assert_eq!(reason, ExitReason::ProfitTarget);
            }
            other => panic!("expected an exit, got {:?}", other),
        }
        drop(desk.commands);
        assert_eq!(next_non_quality(&mut desk.events).await, Some(DeskEvent::Stopped));
    }

    #[tokio::test]
    async fn test_malformed_snapshot_is_rejected() {
        let mut desk = spawn_strategy_desk(seeded(), DeskConfig::default());
        let mut snapshot = entry_snapshot();
        snapshot.spot = dec!(-1);
        desk.commands.send(DeskCommand::Evaluate(snapshot)).await.unwrap();
        assert!(matches!(
            next_non_quality(&mut desk.events).await,
            Some(DeskEvent::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_timer_feeds_desk_until_aborted() {
        let mut desk = spawn_strategy_desk(seeded(), DeskConfig::default());
        let snapshot = entry_snapshot();
        let timer = spawn_timer(Duration::from_millis(5), desk.commands.clone(), move || {
            Some(DeskCommand::Evaluate(snapshot.clone()))
        });

        let first = tokio::time::timeout(Duration::from_secs(5), next_non_quality(&mut desk.events))
            .await
            .unwrap();
        assert!(matches!(first, Some(DeskEvent::Entry { .. })));

        timer.abort();
        assert!(timer.await.unwrap_err().is_cancelled());
        desk.commands.send(DeskCommand::Shutdown).await.unwrap();
        while let Some(event) = desk.events.recv().await {
            if event == DeskEvent::Stopped {
                break;
            }
        }
        assert!(desk.task.await.unwrap() >= 2);
    }
}
