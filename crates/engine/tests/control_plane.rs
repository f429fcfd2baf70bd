use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use configuration::{Settings, SupervisorMode};
use core_types::{
    CommandKind, CommandPayload, CommandPriority, CommandStatus, HeartbeatMetadata,
    OpenPositionParams, Severity, TradeClose, TradeDirection, TradeReport, ViolationKind,
};
use database::{AuditLog, CommandStore, ExecutorStore, MemoryStore};
use engine::{
    AdvisorDecision, ControlPlane, Credentials, Decision, DecisionContext, DeliveryMode,
    EngineError, HeartbeatRequest, ManualClock, RiskAdvisor, StatusReport,
};
use events::{BroadcastPublisher, Channel, FanoutEvent};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    plane: ControlPlane,
    store: Arc<MemoryStore>,
    publisher: BroadcastPublisher,
    clock: Arc<ManualClock>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    harness_with(Settings::default(), None)
}

fn harness_with(settings: Settings, advisor: Option<Arc<dyn RiskAdvisor>>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let publisher = BroadcastPublisher::new(256);
    let clock = Arc::new(ManualClock::new(start()));
    let plane = ControlPlane::new(
        settings,
        store.clone(),
        Arc::new(publisher.clone()),
        clock.clone(),
        advisor,
    )
    .unwrap();
    Harness {
        plane,
        store,
        publisher,
        clock,
    }
}

impl Harness {
    async fn register(&self, user_id: Uuid, name: &str) -> (Uuid, Credentials) {
        let registered = self.plane.executors.register(user_id, name).await.unwrap();
        let creds = Credentials {
            api_key: registered.api_key,
            api_secret: registered.api_secret,
        };
        (registered.executor.executor.id, creds)
    }

    async fn heartbeat(&self, executor_id: Uuid, creds: &Credentials) -> Vec<Uuid> {
        self.plane
            .heartbeats
            .handle(executor_id, creds, HeartbeatRequest::default())
            .await
            .unwrap()
            .pending_commands
            .into_iter()
            .map(|c| c.id)
            .collect()
    }

    async fn enqueue(&self, user_id: Uuid, executor_id: Uuid, priority: CommandPriority) -> Uuid {
        self.plane
            .dispatcher
            .enqueue(user_id, executor_id, CommandPayload::GetStatus, Some(priority))
            .await
            .unwrap()
            .command
            .id
    }
}

#[tokio::test]
async fn heartbeat_pulls_in_priority_then_fifo_order() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;

    let mut ids = Vec::new();
    for priority in [
        CommandPriority::Normal,
        CommandPriority::Urgent,
        CommandPriority::Low,
        CommandPriority::Urgent,
    ] {
        ids.push(h.enqueue(user, exec, priority).await);
        h.clock.advance(Duration::seconds(1));
    }

    let pulled = h.heartbeat(exec, &creds).await;
    assert_eq!(pulled, vec![ids[1], ids[3], ids[0], ids[2]]);

    // Claimed commands stay pending but are never handed out twice.
    let again = h.heartbeat(exec, &creds).await;
    assert!(again.is_empty());
    let first = h.store.get_command(ids[1]).await.unwrap();
    assert_eq!(first.status, CommandStatus::Pending);
    assert!(first.acknowledged_at.is_some());

    let stats = h.plane.metrics.snapshot();
    assert_eq!(stats.claimed, 4);
    assert_eq!(stats.max_latency_ms, 4_000);
}

#[tokio::test]
async fn concurrent_heartbeats_split_commands_without_overlap() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;
    for _ in 0..5 {
        h.enqueue(user, exec, CommandPriority::Normal).await;
    }

    let (a, b) = tokio::join!(h.heartbeat(exec, &creds), h.heartbeat(exec, &creds));
    let mut all: Vec<Uuid> = a.iter().chain(b.iter()).copied().collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 5);
    assert_eq!(a.len() + b.len(), 5);
    assert_eq!(h.plane.metrics.snapshot().claimed, 5);
}

#[tokio::test]
async fn bad_credentials_do_not_touch_liveness() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;
    let (other, other_creds) = h.register(user, "other").await;

    let wrong_secret = Credentials {
        api_key: creds.api_key.clone(),
        api_secret: "ws_guess".into(),
    };
    let err = h
        .plane
        .heartbeats
        .handle(exec, &wrong_secret, HeartbeatRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AuthenticationFailed));

    // Valid credentials, but for a different executor.
    let err = h
        .plane
        .heartbeats
        .handle(exec, &other_creds, HeartbeatRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AuthenticationFailed));

    assert!(h.store.get_executor(exec).await.unwrap().last_heartbeat.is_none());
    assert!(h.store.get_executor(other).await.unwrap().last_heartbeat.is_none());
    assert!(!h.plane.executors.get(user, exec).await.unwrap().is_online);
}

#[tokio::test]
async fn heartbeat_rate_limit_leaves_state_alone() {
    let mut settings = Settings::default();
    settings.rate_limits.heartbeat.max_requests = 2;
    let h = harness_with(settings, None);
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;

    h.heartbeat(exec, &creds).await;
    h.clock.advance(Duration::seconds(5));
    h.heartbeat(exec, &creds).await;
    let stamped = h.store.get_executor(exec).await.unwrap().last_heartbeat;

    h.clock.advance(Duration::seconds(5));
    let err = h
        .plane
        .heartbeats
        .handle(exec, &creds, HeartbeatRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RateLimited { retry_after_secs: 50 }));
    assert_eq!(h.store.get_executor(exec).await.unwrap().last_heartbeat, stamped);
}

#[tokio::test]
async fn status_transitions_are_monotonic() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;
    let (other, other_creds) = h.register(user, "other").await;
    let mut user_events = h.publisher.subscribe(Channel::User(user));

    let id = h.enqueue(user, exec, CommandPriority::Normal).await;
    h.heartbeat(exec, &creds).await;

    let report = |status| StatusReport {
        status,
        result: Some(json!({ "ok": true })),
    };

    let acked = h
        .plane
        .agents
        .update_status(exec, &creds, id, report(CommandStatus::Acknowledged))
        .await
        .unwrap();
    assert_eq!(acked.status, CommandStatus::Acknowledged);

    let done = h
        .plane
        .agents
        .update_status(exec, &creds, id, report(CommandStatus::Executed))
        .await
        .unwrap();
    assert_eq!(done.status, CommandStatus::Executed);
    assert!(done.executed_at.is_some());

    for status in [CommandStatus::Executed, CommandStatus::Acknowledged, CommandStatus::Failed] {
        let err = h
            .plane
            .agents
            .update_status(exec, &creds, id, report(status))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConflictingTransition { current: CommandStatus::Executed }
        ));
    }

    // Another executor cannot see the command at all.
    let err = h
        .plane
        .agents
        .update_status(other, &other_creds, id, report(CommandStatus::Failed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    match user_events.recv().await.unwrap() {
        FanoutEvent::CommandStatus(update) => {
            assert_eq!(update.command_id, id);
            assert_eq!(update.status, CommandStatus::Executed);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.plane.metrics.snapshot().conflicts, 3);
}

#[tokio::test]
async fn foreign_and_unknown_executors_look_the_same() {
    let h = harness();
    let owner = Uuid::new_v4();
    let (exec, _) = h.register(owner, "desk").await;

    let foreign = h
        .plane
        .dispatcher
        .enqueue(Uuid::new_v4(), exec, CommandPayload::Pause, None)
        .await
        .unwrap_err();
    let unknown = h
        .plane
        .dispatcher
        .enqueue(owner, Uuid::new_v4(), CommandPayload::Pause, None)
        .await
        .unwrap_err();
    assert_eq!(foreign.to_string(), unknown.to_string());
    assert!(matches!(foreign, EngineError::NotFound("Executor")));
}

#[tokio::test]
async fn invalid_payload_is_rejected_before_persistence() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, _) = h.register(user, "desk").await;

    let payload = CommandPayload::OpenPosition(OpenPositionParams {
        symbol: "EURUSD".into(),
        direction: TradeDirection::Buy,
        lots: dec!(0),
        stop_loss: None,
        take_profit: None,
        strategy_id: None,
        comment: None,
    });
    let err = h
        .plane
        .dispatcher
        .enqueue(user, exec, payload, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(h.store.list_commands(exec, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn push_only_counts_when_the_agent_is_listening_and_online() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;

    let offline = h
        .plane
        .dispatcher
        .enqueue(user, exec, CommandPayload::Pause, None)
        .await
        .unwrap();
    assert_eq!(offline.delivery.mode, DeliveryMode::QueuedForHeartbeat);
    assert_eq!(
        offline.delivery.message.as_deref(),
        Some("executor offline, command queued")
    );

    let mut agent_feed = h.publisher.subscribe(Channel::Executor(exec));
    h.heartbeat(exec, &creds).await;
    let online = h
        .plane
        .dispatcher
        .enqueue(user, exec, CommandPayload::Resume, Some(CommandPriority::High))
        .await
        .unwrap();
    assert_eq!(online.delivery.mode, DeliveryMode::Pushed);

    match agent_feed.recv().await.unwrap() {
        FanoutEvent::CommandReceived(delivery) => {
            assert_eq!(delivery.id, online.command.id);
            assert_eq!(delivery.command, CommandKind::Resume);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // The pull path still delivers the pushed command.
    assert_eq!(h.heartbeat(exec, &creds).await, vec![online.command.id]);
}

#[tokio::test]
async fn emergency_stop_targets_every_executor_once() {
    let h = harness();
    let user = Uuid::new_v4();
    for name in ["a", "b", "c"] {
        h.register(user, name).await;
    }
    let mut user_events = h.publisher.subscribe(Channel::User(user));

    let report = h
        .plane
        .emergency
        .emergency_stop(user, Some("drawdown".into()))
        .await
        .unwrap();
    assert_eq!(report.executors.len(), 3);
    assert_eq!(report.commands.len(), 3);
    for dispatched in &report.commands {
        assert_eq!(dispatched.command.kind(), CommandKind::EmergencyStop);
        assert_eq!(dispatched.command.priority, CommandPriority::Urgent);
    }

    let audit = h.store.list_audit(user, 50).await.unwrap();
    let stops: Vec<_> = audit.iter().filter(|r| r.action == "emergency_stop").collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].executor_count, 3);
    assert_eq!(stops[0].command_ids.len(), 3);
    assert!(audit.iter().all(|r| r.action != "command_issued"));

    match user_events.recv().await.unwrap() {
        FanoutEvent::EmergencyStop(notice) => assert_eq!(notice.executor_count, 3),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn emergency_stop_without_executors_is_a_no_op() {
    let h = harness();
    let user = Uuid::new_v4();
    let report = h.plane.emergency.emergency_stop(user, None).await.unwrap();
    assert!(report.commands.is_empty());
    assert_eq!(report.notice, "nothing to stop");
    assert!(h.store.list_audit(user, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_commands_are_never_delivered() {
    let mut settings = Settings::default();
    settings.dispatch.command_ttl_secs = 60;
    let h = harness_with(settings, None);
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;
    let id = h.enqueue(user, exec, CommandPriority::Urgent).await;

    h.clock.advance(Duration::seconds(60));
    assert!(h.heartbeat(exec, &creds).await.is_empty());

    let outcome = h.plane.reaper().run_once().await.unwrap();
    assert_eq!(outcome.expired, 1);
    let command = h.store.get_command(id).await.unwrap();
    assert_eq!(command.status, CommandStatus::Failed);
    assert_eq!(command.result, Some(json!({ "error": "expired" })));

    // A second sweep finds nothing.
    assert_eq!(h.plane.reaper().run_once().await.unwrap().expired, 0);
}

#[tokio::test]
async fn claimed_commands_are_not_expired_by_the_reaper() {
    let mut settings = Settings::default();
    settings.dispatch.command_ttl_secs = 60;
    let h = harness_with(settings, None);
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;
    let id = h.enqueue(user, exec, CommandPriority::Normal).await;

    h.clock.advance(Duration::seconds(1));
    assert_eq!(h.heartbeat(exec, &creds).await, vec![id]);

    h.clock.advance(Duration::seconds(120));
    assert_eq!(h.plane.reaper().run_once().await.unwrap().expired, 0);

    let done = h
        .plane
        .agents
        .update_status(
            exec,
            &creds,
            id,
            StatusReport {
                status: CommandStatus::Executed,
                result: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, CommandStatus::Executed);
}

#[tokio::test]
async fn claimed_but_unreported_commands_fail_when_configured() {
    let mut settings = Settings::default();
    settings.dispatch.execution_report_timeout_secs = 120;
    let h = harness_with(settings, None);
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;
    let id = h.enqueue(user, exec, CommandPriority::Normal).await;
    h.heartbeat(exec, &creds).await;

    h.clock.advance(Duration::seconds(119));
    assert_eq!(h.plane.reaper().run_once().await.unwrap().unreported, 0);
    h.clock.advance(Duration::seconds(1));
    assert_eq!(h.plane.reaper().run_once().await.unwrap().unreported, 1);
    assert_eq!(
        h.store.get_command(id).await.unwrap().result,
        Some(json!({ "error": "no execution report" }))
    );
}

struct DenyingAdvisor;

#[async_trait]
impl RiskAdvisor for DenyingAdvisor {
    async fn decide(&self, _: &DecisionContext) -> Result<AdvisorDecision, EngineError> {
        Ok(AdvisorDecision {
            decision: Decision::Deny,
            confidence: 0.95,
            risks: vec!["exposure_limit".into()],
            ttl_secs: None,
        })
    }
}

#[tokio::test]
async fn enforced_denial_blocks_high_risk_commands_only() {
    let mut settings = Settings::default();
    settings.supervisor.mode = SupervisorMode::Enforce;
    let h = harness_with(settings, Some(Arc::new(DenyingAdvisor)));
    let user = Uuid::new_v4();
    let (exec, _) = h.register(user, "desk").await;

    let err = h
        .plane
        .dispatcher
        .enqueue(user, exec, CommandPayload::Restart, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyDenied(reason) if reason == "exposure_limit"));

    // Low-risk kinds and emergency stops are never gated.
    h.plane
        .dispatcher
        .enqueue(user, exec, CommandPayload::Pause, None)
        .await
        .unwrap();
    h.plane
        .dispatcher
        .enqueue(user, exec, CommandPayload::emergency_stop(None), Some(CommandPriority::Urgent))
        .await
        .unwrap();
    assert_eq!(h.store.list_commands(exec, None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn observed_denial_is_annotated_not_enforced() {
    let h = harness_with(Settings::default(), Some(Arc::new(DenyingAdvisor)));
    let user = Uuid::new_v4();
    let (exec, _) = h.register(user, "desk").await;

    let dispatched = h
        .plane
        .dispatcher
        .enqueue(user, exec, CommandPayload::CloseAllPositions, None)
        .await
        .unwrap();
    let verdict = dispatched.supervisor.unwrap();
    assert_eq!(verdict.decision, Decision::Allow);
    assert_eq!(verdict.advisor_decision, Some(Decision::Deny));
}

fn losing_trade(open_time: DateTime<Utc>) -> TradeReport {
    TradeReport {
        ticket: 1001,
        symbol: "EURUSD".into(),
        direction: TradeDirection::Buy,
        lots: dec!(0.1),
        open_price: dec!(1.1000),
        open_time,
        stop_loss: None,
        take_profit: None,
        strategy_id: None,
        profit: dec!(-600),
        commission: dec!(0),
        swap: dec!(0),
    }
}

#[tokio::test]
async fn six_percent_floating_loss_is_a_high_violation() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;

    h.plane
        .heartbeats
        .handle(
            exec,
            &creds,
            HeartbeatRequest {
                status: None,
                metadata: Some(HeartbeatMetadata {
                    balance: Some(dec!(10000)),
                    ..Default::default()
                }),
            },
        )
        .await
        .unwrap();
    h.plane
        .agents
        .report_trade(exec, &creds, losing_trade(start() - Duration::days(1)))
        .await
        .unwrap();

    let exposure = h.plane.exposure.compute_exposure(user).await.unwrap();
    assert_eq!(exposure.balance, dec!(10000));
    assert_eq!(exposure.equity, dec!(9400));
    assert_eq!(exposure.violations.len(), 1);
    assert_eq!(exposure.violations[0].kind, ViolationKind::UnrealizedLoss);
    assert_eq!(exposure.violations[0].severity, Severity::High);
    assert_eq!(exposure.risk_score, 80);
    assert_eq!(exposure.risk_level, Severity::High);

    // The monitor sees the same breach and tells the owner.
    let mut user_events = h.publisher.subscribe(Channel::User(user));
    assert_eq!(h.plane.risk_monitor().run_once().await.unwrap(), 1);
    match user_events.recv().await.unwrap() {
        FanoutEvent::RiskUpdate(alert) => {
            assert_eq!(alert.risk_score, 80);
            assert_eq!(alert.violations[0].kind, ViolationKind::UnrealizedLoss);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn unrepresentable_agent_reports_are_rejected_without_state_change() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;

    let err = h
        .plane
        .heartbeats
        .handle(
            exec,
            &creds,
            HeartbeatRequest {
                status: None,
                metadata: Some(HeartbeatMetadata {
                    balance: Some(dec!(0.0000000000000000000000000001)),
                    ..Default::default()
                }),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(msg) if msg.contains("balance")));
    assert!(h.store.get_executor(exec).await.unwrap().last_heartbeat.is_none());

    let dust = TradeReport {
        lots: dec!(0.0000000000000000000000000001),
        ..losing_trade(start())
    };
    let err = h.plane.agents.report_trade(exec, &creds, dust).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(msg) if msg.contains("lots")));

    // A sane report still goes through and the exposure math stays finite.
    h.plane
        .agents
        .report_trade(exec, &creds, losing_trade(start()))
        .await
        .unwrap();
    let exposure = h.plane.exposure.compute_exposure(user).await.unwrap();
    assert_eq!(exposure.open_position_count, 1);
}

#[tokio::test]
async fn delete_is_refused_while_online_or_holding_positions() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;
    h.heartbeat(exec, &creds).await;
    h.plane
        .agents
        .report_trade(exec, &creds, losing_trade(start()))
        .await
        .unwrap();

    let err = h.plane.executors.delete(user, exec).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(msg) if msg.contains("online")));

    h.clock.advance(Duration::minutes(5));
    let err = h.plane.executors.delete(user, exec).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(msg) if msg.contains("open position")));

    h.plane
        .agents
        .report_trade_close(
            exec,
            &creds,
            1001,
            TradeClose {
                close_price: dec!(1.0940),
                profit: dec!(-600),
                commission: None,
                swap: None,
                close_time: None,
            },
        )
        .await
        .unwrap();
    h.plane.executors.delete(user, exec).await.unwrap();

    assert!(matches!(
        h.plane.executors.get(user, exec).await.unwrap_err(),
        EngineError::NotFound("Executor")
    ));
    assert!(h.plane.executors.list(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn agent_config_names_the_channels() {
    let h = harness();
    let user = Uuid::new_v4();
    let (exec, creds) = h.register(user, "desk").await;

    let config = h.plane.agents.fetch_config(exec, &creds).await.unwrap();
    assert_eq!(config.executor_channel, format!("executor-{exec}"));
    assert_eq!(config.user_channel, format!("user-{user}"));
    assert_eq!(config.stale_window_secs, 300);
}
