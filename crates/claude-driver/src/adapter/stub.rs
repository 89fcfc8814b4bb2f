use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::adapter::{
    Adapter, AdapterNotification, AdapterStatus, ControlReceiver, DoneReason, Health,
    NotificationSender, RawPayload,
};
use crate::control::{OutboundControl, CONTROL_TIMEOUT};
use crate::options::Options;
use crate::{DriverError, Result};

/// Scripted in-memory adapter.
///
/// Each call to `send_query` replays the next scripted emission list as
/// notifications; control requests resolve from a scripted outcome queue.
/// Everything the session sends is recorded so tests can assert on it.
pub struct StubAdapter {
    scripts: VecDeque<Vec<StubEmit>>,
    controls: VecDeque<ControlScript>,
    queries: Arc<Mutex<Vec<(String, String)>>>,
    resumes: Arc<Mutex<Vec<Option<String>>>>,
    interrupts: Arc<AtomicUsize>,
    active: Arc<Mutex<Option<String>>>,
    notify: Option<NotificationSender>,
    plan: StartPlan,
    emit_gap: Option<Duration>,
    info: Option<Value>,
    stopped: bool,
}

/// One scripted notification within a query's replay.
pub enum StubEmit {
    Message(Value),
    Done(DoneReason),
    Error(DriverError),
}

/// Outcome of the next control request.
pub enum ControlScript {
    Success(Value),
    Error(String),
    /// Never respond; the per-request timer fires instead.
    Ignore,
}

#[derive(Clone)]
enum StartPlan {
    Ready { delay: Option<Duration> },
    Fail(String),
}

impl StubAdapter {
    pub fn new() -> Self {
        StubAdapter {
            scripts: VecDeque::new(),
            controls: VecDeque::new(),
            queries: Arc::new(Mutex::new(Vec::new())),
            resumes: Arc::new(Mutex::new(Vec::new())),
            interrupts: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(Mutex::new(None)),
            notify: None,
            plan: StartPlan::Ready { delay: None },
            emit_gap: None,
            info: Some(json!({"commands": []})),
            stopped: false,
        }
    }

    /// Hold `Ready` back for `delay` so queries queue during provisioning.
    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.plan = StartPlan::Ready { delay: Some(delay) };
        self
    }

    /// Provisioning ends in an error status instead of readiness.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.plan = StartPlan::Fail(reason.into());
        self
    }

    /// Script the emissions for the next query, in submission order.
    pub fn on_query(mut self, emits: Vec<StubEmit>) -> Self {
        self.scripts.push_back(emits);
        self
    }

    /// Script the outcome of the next control request.
    pub fn on_control(mut self, outcome: ControlScript) -> Self {
        self.controls.push_back(outcome);
        self
    }

    /// Pause between scripted emissions, letting tests interleave work.
    pub fn emit_gap(mut self, gap: Duration) -> Self {
        self.emit_gap = Some(gap);
        self
    }

    /// Handle onto the recorded `(request_id, prompt)` pairs.
    pub fn sent_queries(&self) -> Arc<Mutex<Vec<(String, String)>>> {
        Arc::clone(&self.queries)
    }

    /// Handle onto the `resume` value each query carried.
    pub fn sent_resumes(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        Arc::clone(&self.resumes)
    }

    pub fn interrupt_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.interrupts)
    }
}

impl Default for StubAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for StubAdapter {
    async fn start(&mut self, notifications: NotificationSender, _options: &Options) -> Result<()> {
        if self.stopped {
            return Err(DriverError::Disconnected("adapter stopped".into()));
        }
        self.notify = Some(notifications.clone());
        let _ = notifications
            .send(AdapterNotification::Status(AdapterStatus::Provisioning))
            .await;

        match self.plan.clone() {
            StartPlan::Ready { delay } => {
                tokio::spawn(async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = notifications
                        .send(AdapterNotification::Status(AdapterStatus::Ready))
                        .await;
                });
            }
            StartPlan::Fail(reason) => {
                tokio::spawn(async move {
                    let _ = notifications
                        .send(AdapterNotification::Status(AdapterStatus::Error(reason)))
                        .await;
                });
            }
        }
        Ok(())
    }

    async fn send_query(
        &mut self,
        request_id: &str,
        prompt: &str,
        options: &Options,
    ) -> Result<()> {
        self.queries
            .lock()
            .expect("queries lock")
            .push((request_id.to_owned(), prompt.to_owned()));
        self.resumes
            .lock()
            .expect("resumes lock")
            .push(options.resume.clone());
        *self.active.lock().expect("active lock") = Some(request_id.to_owned());

        let notify = self
            .notify
            .clone()
            .ok_or_else(|| DriverError::Disconnected("adapter is not running".into()))?;
        let emits = self.scripts.pop_front().unwrap_or_default();
        let request_id = request_id.to_owned();
        let active = Arc::clone(&self.active);
        let gap = self.emit_gap;

        tokio::spawn(async move {
            for emit in emits {
                if let Some(gap) = gap {
                    tokio::time::sleep(gap).await;
                }
                let notification = match emit {
                    StubEmit::Message(value) => AdapterNotification::RawMessage {
                        request_id: request_id.clone(),
                        payload: RawPayload::Json(value),
                    },
                    StubEmit::Done(reason) => {
                        *active.lock().expect("active lock") = None;
                        AdapterNotification::Done {
                            request_id: request_id.clone(),
                            reason,
                        }
                    }
                    StubEmit::Error(error) => {
                        *active.lock().expect("active lock") = None;
                        AdapterNotification::Error {
                            request_id: request_id.clone(),
                            error,
                        }
                    }
                };
                if notify.send(notification).await.is_err() {
                    return;
                }
            }
        });
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        let active_request_id = self.active.lock().expect("active lock").take();
        if let Some(request_id) = active_request_id {
            if let Some(notify) = &self.notify {
                let _ = notify
                    .send(AdapterNotification::Done {
                        request_id,
                        reason: DoneReason::Interrupted,
                    })
                    .await;
            }
        }
        Ok(())
    }

    fn health(&self) -> Health {
        if self.stopped {
            Health::Unhealthy("adapter stopped".into())
        } else {
            Health::Healthy
        }
    }

    async fn stop(&mut self) {
        self.stopped = true;
        self.notify = None;
    }

    async fn send_control_request(&mut self, _control: OutboundControl) -> Result<ControlReceiver> {
        let (tx, rx) = oneshot::channel();
        match self.controls.pop_front() {
            Some(ControlScript::Success(value)) => {
                let _ = tx.send(Ok(value));
            }
            Some(ControlScript::Error(message)) => {
                let _ = tx.send(Err(DriverError::ControlFailed(message)));
            }
            Some(ControlScript::Ignore) => {
                tokio::spawn(async move {
                    tokio::time::sleep(CONTROL_TIMEOUT).await;
                    let _ = tx.send(Err(DriverError::ControlTimeout(
                        CONTROL_TIMEOUT.as_secs(),
                    )));
                });
            }
            None => {
                let _ = tx.send(Ok(json!({})));
            }
        }
        Ok(rx)
    }

    fn server_info(&self) -> Option<Value> {
        self.info.clone()
    }
}
