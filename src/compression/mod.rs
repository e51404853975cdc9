//! zstd codec contexts.
//!
//! A [`Compressor`] turns one chunk into one self-contained zstd frame. A
//! [`Decompressor`] consumes any number of concatenated frames incrementally,
//! so the receiving side never needs to know where sender chunks began.
//!
//! Both are expensive to build and are borrowed from a
//! [`CompressionContextPool`] rather than created per transfer.

pub mod pool;

pub use pool::{CompressionContextPool, PooledContext};

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A reusable, stateful codec handle.
pub trait CodecContext: Send + Sized + 'static {
    fn create(level: i32) -> io::Result<Self>;

    /// Return the context to a pristine state. Called before every reuse.
    fn reset(&mut self) -> io::Result<()>;

    /// Process-unique identity, stable for the life of the context.
    fn id(&self) -> u64;
}

pub struct Compressor {
    id: u64,
    encoder: Encoder<'static>,
}

impl Compressor {
    /// Compress `src` into a single complete frame, replacing the contents
    /// of `dst`. Returns the compressed length.
    pub fn compress_chunk(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<usize> {
        dst.clear();
        dst.resize(zstd::zstd_safe::compress_bound(src.len()), 0);

        let written = {
            let mut input = InBuffer::around(src);
            let mut output = OutBuffer::around(&mut dst[..]);
            while input.pos() < src.len() {
                self.encoder.run(&mut input, &mut output)?;
            }
            while self.encoder.finish(&mut output, true)? != 0 {}
            output.pos()
        };

        dst.truncate(written);
        self.encoder.reinit()?;
        Ok(written)
    }
}

impl CodecContext for Compressor {
    fn create(level: i32) -> io::Result<Self> {
        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            encoder: Encoder::new(level)?,
        })
    }

    fn reset(&mut self) -> io::Result<()> {
        self.encoder.reinit()
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Result of one [`Decompressor::decompress`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStep {
    pub consumed: usize,
    pub produced: usize,
    /// The last frame seen so far has been fully decoded and flushed.
    pub frame_complete: bool,
}

pub struct Decompressor {
    id: u64,
    decoder: Decoder<'static>,
    frame_complete: bool,
}

impl Decompressor {
    /// Feed `src` and write as much output as fits into `dst`.
    ///
    /// Either all of `src` is consumed, or `dst` is full; callers loop until
    /// both input is drained and a call leaves spare room in `dst`.
    pub fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<DecodeStep> {
        let mut input = InBuffer::around(src);
        let capacity = dst.len();
        let mut output = OutBuffer::around(dst);
        loop {
            let before = (input.pos(), output.pos());
            let hint = self.decoder.run(&mut input, &mut output)?;
            let stalled = (input.pos(), output.pos()) == before;
            if !stalled {
                // zstd reports 0 once a frame is decoded and fully flushed.
                self.frame_complete = hint == 0;
            }
            if input.pos() == src.len() || output.pos() == capacity || stalled {
                break;
            }
        }
        Ok(DecodeStep {
            consumed: input.pos(),
            produced: output.pos(),
            frame_complete: self.frame_complete,
        })
    }
}

impl CodecContext for Decompressor {
    fn create(_level: i32) -> io::Result<Self> {
        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            decoder: Decoder::new()?,
            frame_complete: false,
        })
    }

    fn reset(&mut self) -> io::Result<()> {
        self.frame_complete = false;
        self.decoder.reinit()
    }

    fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decompress_all(d: &mut Decompressor, src: &[u8], out_chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; out_chunk];
        let mut pos = 0;
        loop {
            let step = d.decompress(&src[pos..], &mut buf).unwrap();
            pos += step.consumed;
            out.extend_from_slice(&buf[..step.produced]);
            if pos == src.len() && step.produced < buf.len() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_chunk_roundtrip() {
        let mut c = Compressor::create(3).unwrap();
        let mut d = Decompressor::create(0).unwrap();
        let data = b"artifact bytes ".repeat(1000);
        let mut compressed = Vec::new();
        let n = c.compress_chunk(&data, &mut compressed).unwrap();
        assert_eq!(n, compressed.len());
        assert!(n < data.len());
        assert_eq!(decompress_all(&mut d, &compressed, 4096), data);
    }

    #[test]
    fn test_empty_chunk_is_valid_frame() {
        let mut c = Compressor::create(3).unwrap();
        let mut d = Decompressor::create(0).unwrap();
        let mut compressed = Vec::new();
        c.compress_chunk(&[], &mut compressed).unwrap();
        assert!(!compressed.is_empty());
        assert!(decompress_all(&mut d, &compressed, 64).is_empty());
    }

    #[test]
    fn test_concatenated_frames_decode_as_one_stream() {
        let mut c = Compressor::create(1).unwrap();
        let mut d = Decompressor::create(0).unwrap();
        let mut wire = Vec::new();
        let mut frame = Vec::new();
        for part in [&b"first "[..], b"second ", b"third"] {
            c.compress_chunk(part, &mut frame).unwrap();
            wire.extend_from_slice(&frame);
        }
        assert_eq!(decompress_all(&mut d, &wire, 3), b"first second third");
    }

    #[test]
    fn test_truncated_frame_is_not_complete() {
        let mut c = Compressor::create(3).unwrap();
        let mut d = Decompressor::create(0).unwrap();
        let mut frame = Vec::new();
        c.compress_chunk(&b"truncate me ".repeat(100), &mut frame).unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let step = d.decompress(&frame[..frame.len() / 2], &mut buf).unwrap();
        assert!(!step.frame_complete);
        let step = d.decompress(&frame[frame.len() / 2..], &mut buf).unwrap();
        assert!(step.frame_complete);
    }

    #[test]
    fn test_garbage_input_errors() {
        let mut d = Decompressor::create(0).unwrap();
        let mut buf = [0u8; 64];
        assert!(d.decompress(b"this is not a zstd frame", &mut buf).is_err());
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = Compressor::create(3).unwrap();
        let b = Compressor::create(3).unwrap();
        assert_ne!(a.id(), b.id());
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_split(
            data in proptest::collection::vec(any::<u8>(), 0..20_000),
            chunk in 1usize..5_000,
            feed in 1usize..700,
        ) {
            let mut c = Compressor::create(3).unwrap();
            let mut d = Decompressor::create(0).unwrap();
            let mut wire = Vec::new();
            let mut frame = Vec::new();
            if data.is_empty() {
                c.compress_chunk(&[], &mut frame).unwrap();
                wire.extend_from_slice(&frame);
            }
            for part in data.chunks(chunk) {
                c.compress_chunk(part, &mut frame).unwrap();
                wire.extend_from_slice(&frame);
            }

            // Feed the wire bytes in arbitrary slices, as the network would.
            let mut out = Vec::new();
            let mut buf = vec![0u8; 1024];
            for piece in wire.chunks(feed) {
                let mut pos = 0;
                loop {
                    let step = d.decompress(&piece[pos..], &mut buf).unwrap();
                    pos += step.consumed;
                    out.extend_from_slice(&buf[..step.produced]);
                    if pos == piece.len() && step.produced < buf.len() {
                        break;
                    }
                }
            }
            prop_assert_eq!(out, data);
        }
    }
}
