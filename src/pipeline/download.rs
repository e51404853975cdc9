//! Download: receive, decompress, hand to a sink.

use super::{ChunkSink, NotFoundPolicy, PipelineOptions, TransferResult};
use crate::compression::{CompressionContextPool, Decompressor};
use crate::connection::Stream;
use crate::error::{Result, TransferError};
use crate::transport::StatusClass;

/// Smallest output buffer handed to the decoder (8KB). The floor keeps the
/// decoder making progress when the scaled size would be tiny or zero.
const MIN_OUTPUT_BUFFER: usize = 8 * 1024;

/// Size of the next decompression output buffer.
///
/// `buffered` counts input bytes consumed since the decoder last produced
/// output; small frames accumulate before anything comes out, so the
/// allocation grows with them.
pub fn output_buffer_size(buffered: usize, incoming: usize, max: usize) -> usize {
    let want = buffered.saturating_add(incoming).saturating_mul(4);
    want.min(max).max(MIN_OUTPUT_BUFFER.min(max))
}

/// Receive the response on `stream` and write its decompressed body to
/// `sink`. On any failure the sink is discarded before returning.
pub async fn download(
    stream: &mut Stream,
    sink: &mut dyn ChunkSink,
    pool: &CompressionContextPool<Decompressor>,
    options: &PipelineOptions,
    not_found: NotFoundPolicy,
) -> Result<TransferResult> {
    match receive(stream, sink, pool, options, not_found).await {
        Ok(result) => {
            if result.is_not_found() {
                sink.discard().await;
            }
            Ok(result)
        }
        Err(e) => {
            sink.discard().await;
            Err(e)
        }
    }
}

async fn receive(
    stream: &mut Stream,
    sink: &mut dyn ChunkSink,
    pool: &CompressionContextPool<Decompressor>,
    options: &PipelineOptions,
    not_found: NotFoundPolicy,
) -> Result<TransferResult> {
    let head = stream.response().await?;
    match head.class() {
        StatusClass::Success => {}
        StatusClass::NotFound if not_found == NotFoundPolicy::Sentinel => {
            tracing::debug!(stream_id = stream.id(), "object not found, returning sentinel");
            return Ok(TransferResult::not_found());
        }
        _ => {
            return Err(TransferError::UnexpectedStatus {
                status: head.status,
            })
        }
    }

    let mut decoder = pool.checkout()?;
    let mut hasher = blake3::Hasher::new();
    let mut out = Vec::new();
    let mut buffered = 0usize;
    let mut wire_size = 0u64;
    let mut file_size = 0u64;
    let mut complete = false;

    while let Some(frame) = stream.recv().await? {
        wire_size += frame.data.len() as u64;
        let mut input = &frame.data[..];
        loop {
            let size = output_buffer_size(buffered, input.len(), options.max_output_buffer);
            out.resize(size, 0);
            let step = decoder
                .decompress(input, &mut out)
                .map_err(|e| TransferError::corrupted(format!("decompression failed: {}", e)))?;
            input = &input[step.consumed..];
            complete = step.frame_complete;

            if step.produced == 0 {
                buffered += step.consumed;
                if step.consumed == 0 && !input.is_empty() {
                    return Err(TransferError::corrupted("decoder made no progress"));
                }
            } else {
                buffered = 0;
                let chunk = &out[..step.produced];
                hasher.update(chunk);
                sink.write_chunk(chunk).await?;
                file_size += step.produced as u64;
            }

            if input.is_empty() && step.produced < out.len() {
                break;
            }
        }
        if frame.end_of_stream {
            break;
        }
    }

    if !complete {
        return Err(TransferError::corrupted("response body ended mid-frame"));
    }
    sink.finish().await?;

    tracing::debug!(stream_id = stream.id(), wire_size, file_size, "download complete");
    Ok(TransferResult::complete(wire_size, file_size, &hasher))
}
