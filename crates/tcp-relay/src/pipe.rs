use std::net::IpAddr;
use std::sync::Arc;

use flow_audit::{AlertLevel, FlowLedger, StreamId};
use http_assembler::{Message, Mode, StreamAssembler};
use rule_engine::RuleEngine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Size of a single socket read.
const READ_CHUNK: usize = 4096;

/// With no completed message and this much buffered, the stream is treated
/// as something the parser cannot resolve in reasonable space (oversized
/// headers, non-HTTP traffic): the buffer is flushed raw and parsing is
/// permanently disabled for this pipe. The connection stays open.
const PARSE_WINDOW: usize = 4096;

/// Hard ceiling on buffered bytes. Beyond it the buffer is flushed raw to
/// bound memory while parsing stays active; the flushed amount is remembered
/// so a later approval forwards only the remainder of that message.
const FORWARD_CEILING: usize = 10 * 1024 * 1024;

/// Direction of a pipe, for logging.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToTarget => write!(f, "client->target"),
            Direction::TargetToClient => write!(f, "target->client"),
        }
    }
}

/// Everything a directional pipe needs beyond its socket halves.
pub(crate) struct PipeContext {
    pub connection_id: Uuid,
    pub direction: Direction,
    pub engine: Arc<RuleEngine>,
    pub ledger: FlowLedger,
    pub stream_id: StreamId,
    pub client_ip: IpAddr,
    pub target_port: u16,
}

/// Drive one direction of a connection until EOF, error, cancellation, or a
/// drop verdict. Cancels the shared token on the way out so the peer pipe
/// ends promptly.
pub(crate) async fn run_pipe(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mode: Mode,
    ctx: PipeContext,
    cancel: CancellationToken,
) {
    let mut assembler = StreamAssembler::new(mode);
    let mut parsing = true;
    // Bytes read but not yet forwarded, kept verbatim and independent of
    // parse state.
    let mut pending: Vec<u8> = Vec::new();
    // Bytes of the currently-incomplete message already flushed raw by the
    // overflow ceiling; subtracted when that message is eventually approved.
    let mut flushed_ahead: usize = 0;
    let mut chunk = [0u8; READ_CHUNK];

    'pipe: loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break 'pipe,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break 'pipe,
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(connection = %ctx.connection_id, direction = %ctx.direction, %err, "read error, ending pipe");
                    break 'pipe;
                }
            },
        };
        let data = &chunk[..n];

        if !parsing {
            if forward(&mut writer, data).await.is_err() {
                break 'pipe;
            }
            continue;
        }

        pending.extend_from_slice(data);

        let completed = match assembler.feed(data) {
            Ok(completed) => completed,
            Err(err) => {
                tracing::warn!(
                    connection = %ctx.connection_id,
                    direction = %ctx.direction,
                    %err,
                    "stream is not parseable HTTP; switching to raw passthrough"
                );
                parsing = false;
                flushed_ahead = 0;
                let stale = std::mem::take(&mut pending);
                if forward(&mut writer, &stale).await.is_err() {
                    break 'pipe;
                }
                continue;
            }
        };

        if completed.is_empty() {
            if pending.len() > FORWARD_CEILING {
                tracing::warn!(
                    connection = %ctx.connection_id,
                    direction = %ctx.direction,
                    buffered = pending.len(),
                    "buffer ceiling exceeded; flushing raw"
                );
                flushed_ahead += pending.len();
                let overflow = std::mem::take(&mut pending);
                if forward(&mut writer, &overflow).await.is_err() {
                    break 'pipe;
                }
            }
            if pending.len() > PARSE_WINDOW {
                tracing::warn!(
                    connection = %ctx.connection_id,
                    direction = %ctx.direction,
                    buffered = pending.len(),
                    "no complete message within the parse window; switching to raw passthrough"
                );
                parsing = false;
                flushed_ahead = 0;
                let stale = std::mem::take(&mut pending);
                if forward(&mut writer, &stale).await.is_err() {
                    break 'pipe;
                }
            }
            continue;
        }

        for message in completed {
            let wire_len = message.wire_len();
            match message {
                Message::Request(mut request) => {
                    request.client_ip = Some(ctx.client_ip);
                    request.destination_port = ctx.target_port;

                    let action = ctx.engine.evaluate(&request);
                    let tags: Vec<String> = action.tags.iter().cloned().collect();

                    if action.is_drop() {
                        tracing::warn!(
                            connection = %ctx.connection_id,
                            direction = %ctx.direction,
                            method = %request.method,
                            path = %request.path,
                            ?tags,
                            "request blocked"
                        );
                        ctx.ledger.log_request(ctx.stream_id, &request, &tags).await;
                        ctx.ledger
                            .raise_alert_level(ctx.stream_id, AlertLevel::Blocked)
                            .await;
                        // Nothing buffered is forwarded: neither this request
                        // nor any pipelined bytes behind it.
                        break 'pipe;
                    }

                    tracing::debug!(
                        connection = %ctx.connection_id,
                        direction = %ctx.direction,
                        method = %request.method,
                        path = %request.path,
                        ?tags,
                        "request forwarded"
                    );
                    ctx.ledger.log_request(ctx.stream_id, &request, &tags).await;
                }
                Message::Response(response) => {
                    tracing::debug!(
                        connection = %ctx.connection_id,
                        direction = %ctx.direction,
                        status = response.status,
                        "response forwarded"
                    );
                    ctx.ledger.log_response(ctx.stream_id, &response, &[]).await;
                }
            }

            // Forward exactly this message's wire span, minus whatever the
            // overflow ceiling already pushed out. Bytes of later,
            // not-yet-evaluated messages stay in the buffer.
            let already = flushed_ahead.min(wire_len);
            flushed_ahead -= already;
            let take = (wire_len - already).min(pending.len());
            let span: Vec<u8> = pending.drain(..take).collect();
            if forward(&mut writer, &span).await.is_err() {
                break 'pipe;
            }
        }
    }

    cancel.cancel();
    tracing::debug!(connection = %ctx.connection_id, direction = %ctx.direction, "pipe finished");
}

async fn forward(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
