//! WebSocket fan-out: one JSON snapshot per text frame.
//!
//! The server never expects inbound payloads; pings are answered, close
//! completes the handshake, everything else is discarded. Eviction by the
//! state hub turns into a policy-violation close frame.

use std::sync::Arc;

use anyhow::Error;
use hyper::{Body, Request, Response};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;

use proxmox_http::websocket::{
    create_frame, OpCode, WebSocket, WebSocketError, WebSocketErrorKind, WebSocketReader,
};

use crate::state::{Closed, StateHub, Subscription};

use super::AppContext;

pub fn handle_upgrade(
    ctx: Arc<AppContext>,
    req: Request<Body>,
) -> Result<Response<Body>, Error> {
    let (parts, body) = req.into_parts();
    let (_ws, response) = WebSocket::new(parts.headers.clone())?;

    let hub = ctx.hub.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(Request::from_parts(parts, body)).await {
            Ok(upgraded) => {
                if let Err(err) = serve_subscriber(hub, upgraded).await {
                    log::debug!("websocket subscriber ended: {:#}", err);
                }
            }
            Err(err) => log::warn!("websocket upgrade failed: {}", err),
        }
    });

    Ok(response)
}

async fn serve_subscriber(hub: Arc<StateHub>, conn: hyper::upgrade::Upgraded) -> Result<(), Error> {
    let subscription = hub.subscribe();
    let (reader, writer) = tokio::io::split(conn);

    // the reader half only exists to surface control frames; payload data
    // is discarded
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let mut ws_reader = WebSocketReader::new(reader, control_tx);
    let drain = tokio::spawn(async move {
        let mut sink = tokio::io::sink();
        let _ = tokio::io::copy(&mut ws_reader, &mut sink).await;
    });

    let result = frame_loop(subscription, writer, control_rx).await;
    drain.abort();
    result
}

async fn frame_loop(
    mut subscription: Subscription,
    mut writer: WriteHalf<hyper::upgrade::Upgraded>,
    mut control_rx: mpsc::UnboundedReceiver<
        Result<(OpCode, Box<[u8]>), WebSocketError>,
    >,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            frame = subscription.recv() => match frame {
                Ok(snapshot) => {
                    let payload = serde_json::to_vec(&*snapshot)?;
                    let frame = create_frame(None, &payload, OpCode::Text)?;
                    writer.write_all(&frame).await?;
                }
                Err(Closed::Evicted(reason)) => {
                    let close =
                        WebSocketError::new(WebSocketErrorKind::Other, &reason);
                    let frame = create_frame(
                        None,
                        &close.generate_frame_payload(),
                        OpCode::Close,
                    )?;
                    writer.write_all(&frame).await?;
                    writer.shutdown().await?;
                    return Ok(());
                }
            },
            control = control_rx.recv() => match control {
                Some(Ok((OpCode::Ping, message))) => {
                    let frame = create_frame(None, &message, OpCode::Pong)?;
                    writer.write_all(&frame).await?;
                }
                Some(Ok((OpCode::Close, message))) => {
                    let frame = create_frame(None, &message, OpCode::Close)?;
                    writer.write_all(&frame).await?;
                    writer.shutdown().await?;
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let frame = create_frame(
                        None,
                        &err.generate_frame_payload(),
                        OpCode::Close,
                    )?;
                    writer.write_all(&frame).await?;
                    return Err(err.into());
                }
                // connection gone
                None => return Ok(()),
            },
        }
    }
}
