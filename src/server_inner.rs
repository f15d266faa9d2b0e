use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::error::RouterError;
use crate::platform::StreamConfig;
use crate::router::EventRouter;
use crate::service::{
    client_event, server_event, transcoder_server::Transcoder, ClientEvent, ConfigureStream,
    Configured, Connected, RejectReason, Rejected, ServerEvent, StatusRequest, StatusResponse,
};
use crate::session::SessionId;

const OUTBOUND_BUFFER: usize = 16;

pub struct ServerInner {
    router: Arc<EventRouter>,
}

impl ServerInner {
    pub fn new(router: Arc<EventRouter>) -> Self {
        ServerInner { router }
    }
}

#[tonic::async_trait]
impl Transcoder for ServerInner {
    type SessionStream = Pin<Box<dyn Stream<Item = Result<ServerEvent, Status>> + Send>>;

    async fn session(
        &self,
        request: Request<Streaming<ClientEvent>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let session = self.router.on_connect().await.map_err(|e| match e {
            RouterError::ShuttingDown => Status::unavailable(e.to_string()),
            e => Status::internal(e.to_string()),
        })?;

        let in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let _ = tx
            .send(Ok(outbound(server_event::Event::Connected(Connected {
                session_id: session.as_u64(),
            }))))
            .await;

        tokio::spawn(run_connection(self.router.clone(), session, in_stream, tx));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let status = self.router.status().await;
        Ok(Response::new(StatusResponse {
            open_sessions: status.open_sessions as u64,
            bound_transcoders: status.bound_transcoders as u64,
            accepting: status.accepting,
        }))
    }
}

/// Handles one connection's events in arrival order until the client goes
/// away or the process shuts down, then releases the session.
async fn run_connection(
    router: Arc<EventRouter>,
    session: SessionId,
    mut in_stream: Streaming<ClientEvent>,
    tx: mpsc::Sender<Result<ServerEvent, Status>>,
) {
    loop {
        let data = tokio::select! {
            data = in_stream.next() => data,
            _ = router.closed() => break,
        };

        match data {
            Some(Ok(ClientEvent { event: Some(event) })) => {
                if let Some(reply) = dispatch(&router, session, event).await {
                    // The client may already be gone, the stream end tells us.
                    let _ = tx.send(Ok(reply)).await;
                }
            }
            Some(Ok(ClientEvent { event: None })) => {
                log::debug!("{}: empty event", session);
            }
            Some(Err(e)) => {
                log::warn!("{}: error receiving stream: {}", session, e);
                break;
            }
            None => break,
        }
    }

    router.on_disconnect(session).await;
}

async fn dispatch(
    router: &EventRouter,
    session: SessionId,
    event: client_event::Event,
) -> Option<ServerEvent> {
    match event {
        client_event::Event::Configure(configure) => {
            let reply = match router.on_configure(session, stream_config(configure)).await {
                Ok(platform) => server_event::Event::Configured(Configured {
                    platform: platform.to_string(),
                }),
                Err(e) => server_event::Event::Rejected(rejected(&e)),
            };
            Some(outbound(reply))
        }
        client_event::Event::Chunk(bytes) => {
            router.on_chunk(session, &bytes).await;
            None
        }
    }
}

fn stream_config(configure: ConfigureStream) -> StreamConfig {
    StreamConfig {
        platform: configure.platform,
        stream_key: configure.stream_key,
        title: configure.title,
        description: configure.description,
    }
}

fn rejected(error: &RouterError) -> Rejected {
    let reason = match error {
        RouterError::InvalidPlatform(_) => RejectReason::InvalidPlatform,
        RouterError::Launch(_) => RejectReason::LaunchFailed,
        RouterError::ShuttingDown => RejectReason::ShuttingDown,
        RouterError::UnknownSession => RejectReason::Unspecified,
    };
    Rejected {
        reason: reason as i32,
        message: error.to_string(),
    }
}

fn outbound(event: server_event::Event) -> ServerEvent {
    ServerEvent { event: Some(event) }
}
