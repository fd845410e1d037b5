//! Unix socket server for the admin API.
//!
//! One request per connection: the client writes a frame and shuts down
//! its write side, the server answers and closes. `admin.Events` keeps
//! the connection open and streams event frames until the client
//! disconnects or falls too far behind.

use crate::admin::{dispatch, policy, EVENTS_METHOD};
use crate::app::App;
use log::{debug, info, warn};
use qubesd_common::{
    encode_error, encode_event, encode_ok, parse_request, AdminRequest, Event, QubesError,
    QubesResult, MAX_REQUEST_LEN,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

pub struct AdminServer;

impl AdminServer {
    pub async fn bind(app: &Arc<App>) -> QubesResult<UnixListener> {
        let path = &app.settings.socket_path;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| QubesError::io(dir, e))?;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(QubesError::io(path, e)),
        }
        let listener = UnixListener::bind(path).map_err(|e| QubesError::io(path, e))?;
        info!("admin API listening on {}", path.display());
        Ok(listener)
    }

    pub async fn run(app: Arc<App>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let app = app.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(app, stream).await {
                            debug!("admin connection ended: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(app: Arc<App>, mut stream: UnixStream) -> QubesResult<()> {
    // the kernel-provided identity backs the source field of the frame
    match stream.peer_cred() {
        Ok(cred) => debug!("admin connection from uid {}", cred.uid()),
        Err(e) => {
            return Err(QubesError::not_allowed(format!(
                "peer identity unavailable: {}",
                e
            )))
        }
    }

    let mut buf = Vec::new();
    let mut limited = (&mut stream).take(MAX_REQUEST_LEN as u64 + 1);
    limited
        .read_to_end(&mut buf)
        .await
        .map_err(|e| QubesError::protocol(format!("reading request: {}", e)))?;

    let request = match parse_request(&buf) {
        Ok(request) => request,
        Err(e) => {
            let _ = stream.write_all(&encode_error(&e)).await;
            return Err(e);
        }
    };

    if request.method == EVENTS_METHOD {
        return stream_events(app, stream, request).await;
    }

    let response = match dispatch(&app, &request).await {
        Ok(payload) => encode_ok(&payload),
        Err(e) => encode_error(&e),
    };
    stream
        .write_all(&response)
        .await
        .map_err(|e| QubesError::protocol(format!("writing response: {}", e)))?;
    stream
        .shutdown()
        .await
        .map_err(|e| QubesError::protocol(format!("closing connection: {}", e)))?;
    Ok(())
}

/// Stream events, optionally filtered to one subject (the call's dest).
async fn stream_events(
    app: Arc<App>,
    mut stream: UnixStream,
    request: AdminRequest,
) -> QubesResult<()> {
    {
        let store = app.store().await;
        policy::check(
            &store,
            &app.settings.policy_dirs,
            &request.method,
            &request.argument,
            &request.source,
            &request.dest,
        )?;
        if request.dest != "dom0" {
            store.domain(&request.dest)?;
        }
    }
    let filter = if request.dest == "dom0" {
        None
    } else {
        Some(request.dest.clone())
    };

    let mut rx = app.relay.subscribe();
    stream
        .write_all(&encode_event("dom0", &Event::new("connection-established")))
        .await
        .map_err(|e| QubesError::protocol(format!("writing event: {}", e)))?;

    loop {
        match rx.recv().await {
            Ok(relayed) => {
                if let Some(filter) = &filter {
                    if &relayed.subject != filter {
                        continue;
                    }
                }
                if stream
                    .write_all(&encode_event(&relayed.subject, &relayed.event))
                    .await
                    .is_err()
                {
                    // client went away
                    return Ok(());
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(
                    "event subscriber of {} lagged by {} events, closing",
                    request.source, missed
                );
                let _ = stream
                    .write_all(&encode_event(
                        "dom0",
                        &Event::new("connection-overflow").arg("missed", missed.to_string()),
                    ))
                    .await;
                return Err(QubesError::protocol("event queue overflow"));
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
