//! Session manager - attaches to targets and keeps session bookkeeping
//!
//! One background task per manager owns the session table. It watches
//! `Target.detachedFromTarget` and `Target.receivedMessageFromTarget` as a
//! synchronized pair, so a relayed reply can never overtake the detach that
//! follows it (or the other way round).
//!
//! Errors the watcher cannot hand to anyone (a relay for a session nobody
//! knows, an event that fails to decode) go to a small bounded channel read
//! through [`Manager::next_error`]. When that channel is full, new errors are
//! dropped with a warning.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;

use super::relay::{Detacher, SessionTransport};
use super::{Session, SessionMode};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::rpc::protocol::target::{
    AttachToTargetParams, AttachToTargetResult, DetachedFromTarget, ReceivedMessageFromTarget,
    ATTACH_TO_TARGET, DETACHED_FROM_TARGET, RECEIVED_MESSAGE_FROM_TARGET,
};
use crate::rpc::protocol::{SessionId, TargetId};
use crate::rpc::Conn;
use crate::stream::{sync, Stream};

pub(crate) enum Command {
    Register {
        entry: SessionEntry,
        done: oneshot::Sender<()>,
    },
    /// The session was closed locally.
    Forget(SessionId),
}

pub(crate) struct SessionEntry {
    id: SessionId,
    mode: SessionMode,
    conn: Arc<Conn>,
    /// Inbound queue of a legacy session.
    relay: Option<mpsc::Sender<Vec<u8>>>,
    detacher: Arc<Detacher>,
}

type SessionTable = HashMap<SessionId, SessionEntry>;

/// Creates sessions on top of one connection
pub struct Manager {
    conn: Arc<Conn>,
    config: ManagerConfig,
    commands: mpsc::UnboundedSender<Command>,
    errors: Mutex<mpsc::Receiver<Error>>,
    shutdown: Arc<Notify>,
    watcher: Mutex<Option<JoinHandle<SessionTable>>>,
    closed: AtomicBool,
}

impl Manager {
    pub fn new(conn: Arc<Conn>) -> Result<Self> {
        Self::with_config(conn, ManagerConfig::default())
    }

    pub fn with_config(conn: Arc<Conn>, config: ManagerConfig) -> Result<Self> {
        let detached = conn.subscribe(DETACHED_FROM_TARGET)?;
        let received = conn.subscribe(RECEIVED_MESSAGE_FROM_TARGET)?;
        sync(&[&detached, &received])?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::channel(config.error_buffer.max(1));
        let shutdown = Arc::new(Notify::new());

        let watch = Watch {
            conn: Arc::clone(&conn),
            detached,
            received,
            commands: command_rx,
            errors: error_tx,
            shutdown: Arc::clone(&shutdown),
            sessions: HashMap::new(),
        };
        let watcher = tokio::spawn(watch.run());

        Ok(Self {
            conn,
            config,
            commands,
            errors: Mutex::new(errors),
            shutdown,
            watcher: Mutex::new(Some(watcher)),
            closed: AtomicBool::new(false),
        })
    }

    /// Attach to `target_id` and return a session speaking for it.
    ///
    /// Flattened mode is tried first when enabled; if the remote rejects it
    /// the attach is retried in legacy mode.
    pub async fn dial(&self, target_id: impl Into<TargetId>) -> Result<Session> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closing);
        }
        let target_id = target_id.into();
        let (session_id, mode) = self.attach(&target_id).await?;

        let detacher = Detacher::new(
            session_id.clone(),
            Arc::clone(&self.conn),
            self.config.detach_timeout,
            self.commands.clone(),
        );
        let (relay, inbound) = match mode {
            SessionMode::Flattened => {
                match self
                    .conn
                    .add_route(&session_id, self.config.relay_capacity.max(1))
                {
                    Ok(inbound) => (None, inbound),
                    Err(e) => {
                        if let Err(err) = detacher.detach().await {
                            tracing::warn!(%session_id, %target_id, "target may stay attached: {}", err);
                        }
                        return Err(e);
                    }
                }
            }
            SessionMode::Legacy => {
                let (tx, rx) = mpsc::channel(self.config.relay_capacity.max(1));
                (Some(tx), rx)
            }
        };

        let transport = SessionTransport {
            mode,
            session_id: session_id.clone(),
            parent: Arc::clone(&self.conn),
            inbound,
            detacher: Arc::clone(&detacher),
        };
        let tag = (mode == SessionMode::Flattened).then(|| session_id.clone());
        let conn = Conn::spawn(
            transport,
            self.conn.codec(),
            self.conn.config().clone(),
            tag,
        );

        let (done, registered) = oneshot::channel();
        let entry = SessionEntry {
            id: session_id.clone(),
            mode,
            conn: Arc::clone(&conn),
            relay,
            detacher,
        };
        if self.commands.send(Command::Register { entry, done }).is_err()
            || registered.await.is_err()
        {
            // Manager closed underneath us: don't leave the target attached.
            if let Err(e) = conn.close().await {
                tracing::warn!(%session_id, "failed to detach orphaned session: {}", e);
            }
            return Err(Error::Closing);
        }

        tracing::debug!(%session_id, %target_id, %mode, "session attached");
        Ok(Session {
            id: session_id,
            target_id,
            mode,
            conn,
        })
    }

    async fn attach(&self, target_id: &str) -> Result<(SessionId, SessionMode)> {
        let mut flatten = self.config.flatten;
        loop {
            let params = serde_json::to_value(AttachToTargetParams {
                target_id: target_id.to_string(),
                flatten,
            })?;
            match self
                .conn
                .invoke_as::<AttachToTargetResult>(ATTACH_TO_TARGET, Some(params))
                .await
            {
                Ok(reply) => {
                    let mode = if reply.flatten.unwrap_or(flatten) {
                        SessionMode::Flattened
                    } else {
                        SessionMode::Legacy
                    };
                    return Ok((reply.session_id, mode));
                }
                Err(Error::Remote(e)) if flatten => {
                    tracing::debug!(%target_id, "flattened attach rejected, retrying legacy: {}", e);
                    flatten = false;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Next error from the background watcher. `None` once the manager is
    /// closed and every reported error has been read.
    pub async fn next_error(&self) -> Option<Error> {
        self.errors.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop watching and close every session still open.
    ///
    /// Errors from individual sessions are collected; more than one comes
    /// back as [`Error::Multiple`]. The connection itself stays open. A
    /// second call returns [`Error::Closing`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closing);
        }
        self.shutdown.notify_one();

        let watcher = self.watcher.lock().await.take();
        let sessions = match watcher {
            Some(handle) => match handle.await {
                Ok(sessions) => sessions,
                Err(e) => {
                    tracing::error!("session watcher failed: {}", e);
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        tracing::debug!(sessions = sessions.len(), "closing session manager");
        let results = join_all(sessions.into_values().map(|entry| async move {
            match entry.conn.close().await {
                Err(Error::Closing) => Ok(()),
                other => other,
            }
        }))
        .await;

        Error::merge(results.into_iter().filter_map(|r| r.err()).collect())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

struct Watch {
    conn: Arc<Conn>,
    detached: Stream,
    received: Stream,
    commands: mpsc::UnboundedReceiver<Command>,
    errors: mpsc::Sender<Error>,
    shutdown: Arc<Notify>,
    sessions: SessionTable,
}

impl Watch {
    async fn run(mut self) -> SessionTable {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = self.detached.ready() => {
                    match self.detached.recv::<DetachedFromTarget>().await {
                        Ok(event) => self.on_detached(event),
                        Err(e) if e.is_closing() => break,
                        Err(e) => self.report(e),
                    }
                }
                _ = self.received.ready() => {
                    match self.received.recv::<ReceivedMessageFromTarget>().await {
                        Ok(event) => self.on_message(event).await,
                        Err(e) if e.is_closing() => break,
                        Err(e) => self.report(e),
                    }
                }
            }
        }
        // Settle commands already sent so close() sees an up to date table.
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        if self.conn.is_closed() {
            // Nothing will be relayed any more. End every legacy session's
            // inbound queue so it tears down instead of waiting forever.
            for entry in self.sessions.values_mut() {
                entry.detacher.mark_detached();
                entry.relay.take();
            }
        }
        tracing::debug!(sessions = self.sessions.len(), "session watcher stopped");
        self.sessions
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register { entry, done } => {
                self.sessions.insert(entry.id.clone(), entry);
                let _ = done.send(());
            }
            Command::Forget(session_id) => {
                if self.sessions.remove(&session_id).is_some() {
                    tracing::trace!(%session_id, "session forgotten");
                }
            }
        }
    }

    fn on_detached(&mut self, event: DetachedFromTarget) {
        let Some(entry) = self.sessions.remove(&event.session_id) else {
            tracing::debug!(session_id = %event.session_id, "detach for unknown session");
            return;
        };
        tracing::debug!(session_id = %entry.id, mode = %entry.mode, "session detached by remote");
        entry.detacher.mark_detached();
        // Ending the inbound queue lets the session drain and then close.
        self.conn.remove_route(&entry.id);
    }

    async fn on_message(&mut self, event: ReceivedMessageFromTarget) {
        let Some(entry) = self.sessions.get(&event.session_id) else {
            self.report(Error::UnknownSession(event.session_id));
            return;
        };
        let Some(relay) = &entry.relay else {
            self.report(Error::Transport(format!(
                "relayed message for flattened session {}",
                event.session_id
            )));
            return;
        };
        if relay.send(event.message.into_bytes()).await.is_err() {
            tracing::debug!(session_id = %event.session_id, "relay for closed session dropped");
        }
    }

    fn report(&self, err: Error) {
        match self.errors.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                tracing::warn!("session error dropped, channel full: {}", err);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::conn::testing::pair;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[derive(Default, Clone, Copy)]
    struct Behavior {
        reject_flatten: bool,
        ignore_detach: bool,
        /// Acknowledge relayed messages but never answer them.
        mute_relay: bool,
        /// Neither acknowledge nor answer relayed messages.
        stall_relay: bool,
        /// Hang up right after answering the first attach.
        hang_up_after_attach: bool,
    }

    /// A fake browser answering Target.* calls and echoing everything else.
    struct Browser {
        calls: Arc<StdMutex<Vec<Value>>>,
        inject: mpsc::UnboundedSender<Value>,
    }

    impl Browser {
        fn calls_to(&self, method: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c["method"] == method)
                .count()
        }

        fn inject(&self, method: &str, params: Value) {
            self.inject
                .send(json!({ "method": method, "params": params }))
                .unwrap();
        }
    }

    fn start(behavior: Behavior) -> (Arc<Conn>, Browser) {
        let (conn, mut remote) = pair();
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let (inject, mut injected) = mpsc::unbounded_channel::<Value>();

        let log = Arc::clone(&calls);
        tokio::spawn(async move {
            let mut attached = 0;
            loop {
                let req = tokio::select! {
                    biased;
                    Some(frame) = injected.recv() => {
                        remote.send(frame).await;
                        continue;
                    }
                    req = remote.next_request() => match req {
                        Some(req) => req,
                        None => break,
                    },
                };
                log.lock().unwrap().push(req.clone());

                let id = req["id"].clone();
                let method = req["method"].as_str().unwrap_or_default().to_string();
                if let Some(sid) = req.get("sessionId").and_then(Value::as_str) {
                    remote
                        .send(json!({
                            "id": id,
                            "result": { "echo": method, "session": sid },
                            "sessionId": sid,
                        }))
                        .await;
                    continue;
                }

                match method.as_str() {
                    ATTACH_TO_TARGET => {
                        if behavior.reject_flatten && req["params"]["flatten"] == true {
                            remote
                                .send(json!({ "id": id, "error": { "code": -32602, "message": "Invalid parameters" } }))
                                .await;
                            continue;
                        }
                        attached += 1;
                        remote
                            .reply(&id, json!({ "sessionId": format!("S{attached}") }))
                            .await;
                        if behavior.hang_up_after_attach {
                            remote.hang_up().await;
                        }
                    }
                    "Target.detachFromTarget" => {
                        if behavior.ignore_detach {
                            continue;
                        }
                        let sid = req["params"]["sessionId"].clone();
                        remote.reply(&id, json!({})).await;
                        remote
                            .event(DETACHED_FROM_TARGET, json!({ "sessionId": sid }))
                            .await;
                    }
                    "Target.sendMessageToTarget" => {
                        if behavior.stall_relay {
                            continue;
                        }
                        if behavior.mute_relay {
                            remote.reply(&id, json!({})).await;
                            continue;
                        }
                        let sid = req["params"]["sessionId"].as_str().unwrap().to_string();
                        let inner: Value =
                            serde_json::from_str(req["params"]["message"].as_str().unwrap())
                                .unwrap();
                        remote.reply(&id, json!({})).await;
                        let reply = json!({
                            "id": inner["id"],
                            "result": { "echo": inner["method"], "session": sid },
                        });
                        remote
                            .event(
                                RECEIVED_MESSAGE_FROM_TARGET,
                                json!({ "sessionId": sid, "message": reply.to_string() }),
                            )
                            .await;
                    }
                    _ => remote.reply(&id, json!({ "echo": method })).await,
                }
            }
        });

        (conn, Browser { calls, inject })
    }

    fn legacy() -> ManagerConfig {
        ManagerConfig {
            flatten: false,
            ..ManagerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_flattened_session_runs_beside_parent() {
        let (conn, browser) = start(Behavior::default());
        let manager = Manager::new(Arc::clone(&conn)).unwrap();

        let session = manager.dial("T1").await.unwrap();
        assert_eq!(session.mode(), SessionMode::Flattened);
        assert_eq!(session.id(), "S1");
        assert_eq!(session.target_id(), "T1");
        assert_eq!(session.conn().session_id(), Some("S1"));

        let (child, parent) = tokio::join!(
            session.conn().invoke("Page.enable", None),
            conn.invoke("Browser.getVersion", None),
        );
        let child = child.unwrap();
        assert_eq!(child["echo"], "Page.enable");
        assert_eq!(child["session"], "S1");
        assert_eq!(parent.unwrap()["echo"], "Browser.getVersion");
        assert_eq!(browser.calls_to("Target.sendMessageToTarget"), 0);
    }

    #[tokio::test]
    async fn test_flattened_session_events_stay_in_session() {
        let (conn, browser) = start(Behavior::default());
        let manager = Manager::new(Arc::clone(&conn)).unwrap();
        let session = manager.dial("T1").await.unwrap();

        let in_session = session.conn().subscribe("Page.loadEventFired").unwrap();
        let on_parent = conn.subscribe("Page.loadEventFired").unwrap();
        browser
            .inject
            .send(json!({ "method": "Page.loadEventFired", "params": { "n": 1 }, "sessionId": "S1" }))
            .unwrap();

        let event: Value = in_session.recv().await.unwrap();
        assert_eq!(event["n"], 1);
        let nothing = tokio::time::timeout(Duration::from_millis(50), on_parent.recv::<Value>()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_legacy_session_relays_messages() {
        let (conn, browser) = start(Behavior::default());
        let manager = Manager::with_config(Arc::clone(&conn), legacy()).unwrap();

        let session = manager.dial("T1").await.unwrap();
        assert_eq!(session.mode(), SessionMode::Legacy);
        assert_eq!(session.conn().session_id(), None);

        let calls: Vec<_> = (0..4)
            .map(|i| {
                let conn = Arc::clone(session.conn());
                tokio::spawn(async move { conn.invoke(format!("Domain.m{i}"), None).await })
            })
            .collect();
        for (i, call) in calls.into_iter().enumerate() {
            let reply = call.await.unwrap().unwrap();
            assert_eq!(reply["echo"], format!("Domain.m{i}"));
            assert_eq!(reply["session"], "S1");
        }
        assert_eq!(browser.calls_to("Target.sendMessageToTarget"), 4);
    }

    #[tokio::test]
    async fn test_falls_back_to_legacy_when_flatten_rejected() {
        let (conn, browser) = start(Behavior {
            reject_flatten: true,
            ..Behavior::default()
        });
        let manager = Manager::new(conn).unwrap();

        let session = manager.dial("T1").await.unwrap();
        assert_eq!(session.mode(), SessionMode::Legacy);
        assert_eq!(browser.calls_to(ATTACH_TO_TARGET), 2);

        let reply = session.conn().invoke("Runtime.enable", None).await.unwrap();
        assert_eq!(reply["session"], "S1");
    }

    #[tokio::test]
    async fn test_local_close_detaches_once() {
        let (conn, browser) = start(Behavior::default());
        let manager = Manager::new(conn).unwrap();
        let session = manager.dial("T1").await.unwrap();

        assert_ok!(session.close().await);
        assert!(matches!(session.close().await, Err(Error::Closing)));
        assert!(matches!(
            session.conn().invoke("Page.enable", None).await,
            Err(Error::Closing)
        ));

        // Forgotten, so closing the manager doesn't detach again.
        assert_ok!(manager.close().await);
        assert_eq!(browser.calls_to("Target.detachFromTarget"), 1);
    }

    #[tokio::test]
    async fn test_remote_detach_closes_session_without_detach_call() {
        let (conn, browser) = start(Behavior::default());
        let manager = Manager::with_config(conn, legacy()).unwrap();
        let session = manager.dial("T1").await.unwrap();

        browser.inject(DETACHED_FROM_TARGET, json!({ "sessionId": "S1" }));
        tokio::time::timeout(Duration::from_secs(1), session.conn().closed())
            .await
            .unwrap();

        assert!(session.conn().is_closed());
        assert!(matches!(session.close().await, Err(Error::Closing)));
        assert_ok!(manager.close().await);
        assert_eq!(browser.calls_to("Target.detachFromTarget"), 0);
    }

    #[tokio::test]
    async fn test_remote_detach_of_flattened_session() {
        let (conn, browser) = start(Behavior::default());
        let manager = Manager::new(Arc::clone(&conn)).unwrap();
        let session = manager.dial("T1").await.unwrap();
        let other = manager.dial("T2").await.unwrap();

        browser.inject(DETACHED_FROM_TARGET, json!({ "sessionId": "S1" }));
        session.conn().closed().await;

        // Only the detached session goes; parent and sibling keep working.
        assert!(!conn.is_closed());
        assert_eq!(other.conn().invoke("Page.enable", None).await.unwrap()["session"], "S2");
        assert_eq!(browser.calls_to("Target.detachFromTarget"), 0);

        assert_ok!(manager.close().await);
        assert_eq!(browser.calls_to("Target.detachFromTarget"), 1);
    }

    #[tokio::test]
    async fn test_relay_for_unknown_session_is_reported() {
        let (conn, browser) = start(Behavior::default());
        let manager = Manager::with_config(Arc::clone(&conn), legacy()).unwrap();
        let session = manager.dial("T1").await.unwrap();

        browser.inject(
            RECEIVED_MESSAGE_FROM_TARGET,
            json!({ "sessionId": "S99", "message": "{\"id\":1,\"result\":{}}" }),
        );
        // The relayed reply below travels behind the bogus one.
        let reply = session.conn().invoke("Page.enable", None).await.unwrap();
        assert_eq!(reply["session"], "S1");

        match manager.next_error().await {
            Some(Error::UnknownSession(id)) => assert_eq!(id, "S99"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_channel_drops_when_full() {
        let (conn, browser) = start(Behavior::default());
        let config = ManagerConfig {
            error_buffer: 1,
            ..legacy()
        };
        let manager = Manager::with_config(conn, config).unwrap();
        let session = manager.dial("T1").await.unwrap();

        for sid in ["S97", "S98", "S99"] {
            browser.inject(
                RECEIVED_MESSAGE_FROM_TARGET,
                json!({ "sessionId": sid, "message": "{}" }),
            );
        }
        assert_ok!(session.conn().invoke("Page.enable", None).await);

        assert!(matches!(
            manager.next_error().await,
            Some(Error::UnknownSession(id)) if id == "S97"
        ));
        let more = tokio::time::timeout(Duration::from_millis(50), manager.next_error()).await;
        assert!(more.is_err());
    }

    #[tokio::test]
    async fn test_detach_timeout() {
        let (conn, _browser) = start(Behavior {
            ignore_detach: true,
            ..Behavior::default()
        });
        let config = ManagerConfig {
            detach_timeout: Duration::from_millis(50),
            ..ManagerConfig::default()
        };
        let manager = Manager::with_config(conn, config).unwrap();
        let session = manager.dial("T1").await.unwrap();

        assert!(matches!(session.close().await, Err(Error::Timeout)));
        assert!(session.conn().is_closed());
    }

    #[tokio::test]
    async fn test_close_closes_every_session() {
        let (conn, browser) = start(Behavior::default());
        let manager = Manager::new(Arc::clone(&conn)).unwrap();
        let first = manager.dial("T1").await.unwrap();
        let second = manager.dial("T2").await.unwrap();

        assert_ok!(manager.close().await);
        assert!(first.conn().is_closed());
        assert!(second.conn().is_closed());
        assert_eq!(browser.calls_to("Target.detachFromTarget"), 2);

        assert!(matches!(manager.close().await, Err(Error::Closing)));
        assert!(matches!(manager.dial("T3").await, Err(Error::Closing)));
        assert!(manager.next_error().await.is_none());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_merges_session_errors() {
        let (conn, _browser) = start(Behavior {
            ignore_detach: true,
            ..Behavior::default()
        });
        let config = ManagerConfig {
            detach_timeout: Duration::from_millis(20),
            ..ManagerConfig::default()
        };
        let manager = Manager::with_config(conn, config).unwrap();
        manager.dial("T1").await.unwrap();
        manager.dial("T2").await.unwrap();

        match manager.close().await {
            Err(Error::Multiple(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().all(|e| matches!(e, Error::Timeout)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn wait_for_call(browser: &Browser, method: &str) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while browser.calls_to(method) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_parent_close_fails_legacy_session_calls() {
        let (conn, browser) = start(Behavior {
            mute_relay: true,
            ..Behavior::default()
        });
        let manager = Manager::with_config(Arc::clone(&conn), legacy()).unwrap();
        let session = manager.dial("T1").await.unwrap();

        let call = {
            let conn = Arc::clone(session.conn());
            tokio::spawn(async move { conn.invoke("Page.enable", None).await })
        };
        wait_for_call(&browser, "Target.sendMessageToTarget").await;
        assert_ok!(conn.close().await);

        let res = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("session call must not outlive the parent")
            .unwrap();
        assert!(matches!(res, Err(Error::Closing)));
        tokio::time::timeout(Duration::from_secs(1), session.conn().closed())
            .await
            .unwrap();
        assert!(session.conn().is_closed());
        assert_eq!(browser.calls_to("Target.detachFromTarget"), 0);
    }

    #[tokio::test]
    async fn test_cancel_legacy_call_stuck_in_relay() {
        let (conn, browser) = start(Behavior {
            stall_relay: true,
            ..Behavior::default()
        });
        let manager = Manager::with_config(conn, legacy()).unwrap();
        let session = manager.dial("T1").await.unwrap();

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let call = {
            let conn = Arc::clone(session.conn());
            tokio::spawn(async move {
                conn.invoke_until("Page.enable", None, async {
                    let _ = cancel_rx.await;
                })
                .await
            })
        };
        wait_for_call(&browser, "Target.sendMessageToTarget").await;
        cancel_tx.send(()).unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("cancel must interrupt the relay write")
            .unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(!session.conn().is_closed());
    }

    #[tokio::test]
    async fn test_dial_on_closing_parent_returns_closing() {
        let (conn, _browser) = start(Behavior {
            hang_up_after_attach: true,
            ..Behavior::default()
        });
        let manager = Manager::new(Arc::clone(&conn)).unwrap();

        // The parent is gone before the session can be routed.
        assert!(matches!(manager.dial("T1").await, Err(Error::Closing)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_parent_close_ends_watcher() {
        let (conn, _browser) = start(Behavior::default());
        let manager = Manager::new(Arc::clone(&conn)).unwrap();
        let session = manager.dial("T1").await.unwrap();

        assert_ok!(conn.close().await);
        session.conn().closed().await;
        // The watcher stopped on its own; errors channel ends.
        assert!(manager.next_error().await.is_none());
    }
}
