//! Scripted transport shared by the integration suites.
//!
//! Streams and REST responses are scripted up front (or driven live
//! through a channel); every outbound request and control message is
//! recorded for assertions.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use broker_gateway::transport::{
    BrokerStream, BrokerTransport, HttpRequest, HttpResponse, StreamMessage, TransportError,
};

pub type StreamItem = Result<Option<StreamMessage>, TransportError>;

pub enum StreamScript {
    Fixed(VecDeque<StreamItem>),
    Live(mpsc::UnboundedReceiver<StreamItem>),
}

struct ScriptedStream {
    script: StreamScript,
    sent: Arc<Mutex<Vec<StreamMessage>>>,
}

#[async_trait]
impl BrokerStream for ScriptedStream {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>, TransportError> {
        match &mut self.script {
            StreamScript::Fixed(items) => match items.pop_front() {
                Some(item) => item,
                None => {
                    // Script exhausted: hold the connection open.
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            },
            StreamScript::Live(rx) => match rx.recv().await {
                Some(item) => item,
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            },
        }
    }

    async fn send(&mut self, message: StreamMessage) -> Result<(), TransportError> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

enum ScriptedResponse {
    Respond(HttpResponse),
    Fail(TransportError),
}

/// Transport whose REST responses and stream contents are scripted.
pub struct ScriptedTransport {
    streams: Mutex<VecDeque<StreamScript>>,
    responses: Mutex<Vec<(String, ScriptedResponse)>>,
    pub requests: Mutex<Vec<HttpRequest>>,
    pub sent: Arc<Mutex<Vec<StreamMessage>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(VecDeque::new()),
            responses: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Queue a fixed stream for the next connection.
    pub fn push_stream(&self, items: Vec<StreamItem>) {
        self.streams
            .lock()
            .push_back(StreamScript::Fixed(items.into()));
    }

    /// Queue a live-driven stream; push items through the sender.
    pub fn push_live_stream(&self) -> mpsc::UnboundedSender<StreamItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push_back(StreamScript::Live(rx));
        tx
    }

    /// Script one response for the next request whose path contains
    /// `path_fragment`. Scripted entries are consumed in order.
    pub fn respond_json(&self, path_fragment: &str, status: u16, body: serde_json::Value) {
        self.responses.lock().push((
            path_fragment.to_string(),
            ScriptedResponse::Respond(HttpResponse { status, body }),
        ));
    }

    /// Script a transport failure for the next matching request.
    pub fn fail(&self, path_fragment: &str, error: TransportError) {
        self.responses
            .lock()
            .push((path_fragment.to_string(), ScriptedResponse::Fail(error)));
    }

    /// How many recorded requests have a path containing `fragment`.
    pub fn request_count(&self, fragment: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path.contains(fragment))
            .count()
    }

    /// Whether any control message sent on a stream contains `fragment`.
    pub fn sent_contains(&self, fragment: &str) -> bool {
        self.sent
            .lock()
            .iter()
            .any(|m| matches!(m, StreamMessage::Text(t) if t.contains(fragment)))
    }
}

#[async_trait]
impl BrokerTransport for ScriptedTransport {
    async fn send_request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = request.path.clone();
        self.requests.lock().push(request);

        let mut responses = self.responses.lock();
        let position = responses.iter().position(|(frag, _)| path.contains(frag));
        match position.map(|i| responses.remove(i).1) {
            Some(ScriptedResponse::Respond(response)) => Ok(response),
            Some(ScriptedResponse::Fail(error)) => Err(error),
            None => Ok(HttpResponse {
                status: 200,
                body: serde_json::Value::Null,
            }),
        }
    }

    async fn open_stream(&self, _endpoint: &str) -> Result<Box<dyn BrokerStream>, TransportError> {
        match self.streams.lock().pop_front() {
            Some(script) => Ok(Box::new(ScriptedStream {
                script,
                sent: Arc::clone(&self.sent),
            })),
            None => Err(TransportError::ConnectionRefused(
                "no scripted stream".to_string(),
            )),
        }
    }
}
