/*
 * Conversation Assistant - Audio Ring Buffer
 * Copyright (c) 2024 Conversation Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

use crate::types::ChannelKey;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Invalid sample alignment: {length} bytes is not a multiple of {alignment}")]
    Misaligned { length: usize, alignment: usize },
}

/// Lifetime counters for one channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelMetrics {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub overflow_count: u64,
    pub underrun_count: u64,
}

#[derive(Debug)]
struct ChannelState {
    chunks: VecDeque<Bytes>,
    size: usize,
    last_write: Option<DateTime<Utc>>,
    last_read: Option<DateTime<Utc>>,
    metrics: ChannelMetrics,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            last_write: None,
            last_read: None,
            metrics: ChannelMetrics::default(),
        }
    }

    /// Pop exactly `size` bytes, splitting a stored chunk when needed and
    /// pushing the remainder back at the head.
    fn pop_bytes(&mut self, size: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(size);
        let mut remaining = size;
        while remaining > 0 {
            let mut chunk = self
                .chunks
                .pop_front()
                .expect("size accounting out of sync with stored chunks");
            if chunk.len() <= remaining {
                remaining -= chunk.len();
                self.size -= chunk.len();
                out.extend_from_slice(&chunk);
            } else {
                let taken = chunk.split_to(remaining);
                self.size -= remaining;
                remaining = 0;
                out.extend_from_slice(&taken);
                self.chunks.push_front(chunk);
            }
        }
        out.freeze()
    }

    /// Drop oldest bytes until `incoming` more fit under `max_size`.
    fn drop_for(&mut self, incoming: usize, max_size: usize) {
        let mut to_drop = (self.size + incoming).saturating_sub(max_size);
        while to_drop > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            if chunk.len() <= to_drop {
                to_drop -= chunk.len();
                self.size -= chunk.len();
            } else {
                let _ = chunk.split_to(to_drop);
                self.size -= to_drop;
                to_drop = 0;
                self.chunks.push_front(chunk);
            }
        }
    }
}

struct ChannelSlot {
    state: Mutex<ChannelState>,
    notify: Notify,
}

/// Snapshot returned by [`AudioRingBuffer::status`].
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    /// Fill percentage per channel (size / max_size * 100).
    pub levels: HashMap<ChannelKey, f64>,
    /// Queued latency per channel in milliseconds.
    pub latencies_ms: HashMap<ChannelKey, f64>,
    /// Channels currently holding data.
    pub active_channels: HashSet<ChannelKey>,
    pub metrics: HashMap<ChannelKey, ChannelMetrics>,
}

/// Bounded per-channel FIFO of PCM16 byte slices.
///
/// Writes and reads on one channel are serialized behind that channel's
/// mutex; operations on different channels are independent. Overflow drops
/// the oldest data and is counted, never raised.
pub struct AudioRingBuffer {
    max_size: usize,
    chunk_size: usize,
    sample_rate: u32,
    channels: HashMap<ChannelKey, ChannelSlot>,
}

impl AudioRingBuffer {
    pub fn new(max_size: usize, chunk_size: usize, sample_rate: u32) -> Arc<Self> {
        let channels = ChannelKey::ALL
            .into_iter()
            .map(|key| {
                (
                    key,
                    ChannelSlot {
                        state: Mutex::new(ChannelState::new()),
                        notify: Notify::new(),
                    },
                )
            })
            .collect();
        Arc::new(Self {
            max_size,
            chunk_size,
            sample_rate,
            channels,
        })
    }

    fn slot(&self, channel: Option<ChannelKey>) -> &ChannelSlot {
        let key = channel.unwrap_or(ChannelKey::Main);
        &self.channels[&key]
    }

    /// Append aligned PCM16 bytes to a channel.
    ///
    /// Writing zero bytes is a no-op. When the write would exceed
    /// `max_size`, the oldest bytes are dropped until the new data fits and
    /// `overflow_count` is incremented once for the write.
    pub async fn write(&self, data: Bytes, channel: Option<ChannelKey>) -> Result<(), BufferError> {
        if data.len() % 2 != 0 {
            return Err(BufferError::Misaligned {
                length: data.len(),
                alignment: 2,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let slot = self.slot(channel);
        {
            let mut state = slot.state.lock().await;
            let len = data.len();

            if state.size + len > self.max_size {
                state.metrics.overflow_count += 1;
                state.drop_for(len, self.max_size);
            }

            // A single write larger than the whole buffer keeps only its tail.
            let stored = if len > self.max_size {
                data.slice(len - self.max_size..)
            } else {
                data
            };

            state.size += stored.len();
            state.chunks.push_back(stored);
            state.last_write = Some(Utc::now());
            state.metrics.bytes_written += len as u64;
        }
        slot.notify.notify_waiters();
        Ok(())
    }

    /// Read exactly `size` bytes (default `chunk_size`) or nothing.
    ///
    /// With a timeout, waits for data up to the deadline; if the channel is
    /// still short afterwards, `underrun_count` is incremented and `None` is
    /// returned.
    pub async fn read(
        &self,
        size: Option<usize>,
        channel: Option<ChannelKey>,
        timeout: Option<Duration>,
    ) -> Option<Bytes> {
        let read_size = size.unwrap_or(self.chunk_size);
        if read_size == 0 {
            return Some(Bytes::new());
        }
        let slot = self.slot(channel);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            {
                let mut state = slot.state.lock().await;
                if state.size >= read_size {
                    let data = state.pop_bytes(read_size);
                    state.last_read = Some(Utc::now());
                    state.metrics.bytes_read += data.len() as u64;
                    return Some(data);
                }
                let expired = match deadline {
                    None => true,
                    Some(d) => Instant::now() >= d,
                };
                if expired {
                    state.metrics.underrun_count += 1;
                    return None;
                }
            }

            // Bounded wait: a notify wakes us early, the sleep bounds the
            // window where a notification can slip past lock release.
            let remaining = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(10));
            let wait = remaining.min(Duration::from_millis(10));
            tokio::select! {
                _ = slot.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Endless stream of `chunk_size` buffers from a channel.
    ///
    /// When the channel is empty the consumer suspends cooperatively until
    /// data arrives; stream waits do not count as underruns.
    pub fn read_stream(
        self: &Arc<Self>,
        channel: Option<ChannelKey>,
    ) -> impl Stream<Item = Bytes> + Send {
        let buffer = Arc::clone(self);
        futures::stream::unfold((), move |()| {
            let buffer = Arc::clone(&buffer);
            async move {
                loop {
                    let slot = buffer.slot(channel);
                    {
                        let mut state = slot.state.lock().await;
                        if state.size >= buffer.chunk_size {
                            let data = state.pop_bytes(buffer.chunk_size);
                            state.last_read = Some(Utc::now());
                            state.metrics.bytes_read += data.len() as u64;
                            return Some((data, ()));
                        }
                    }
                    tokio::select! {
                        _ = slot.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                    }
                }
            }
        })
    }

    /// Snapshot of fill levels, latency, active channels and lifetime metrics.
    pub async fn status(&self) -> BufferStatus {
        let mut levels = HashMap::new();
        let mut latencies_ms = HashMap::new();
        let mut active_channels = HashSet::new();
        let mut metrics = HashMap::new();

        for (key, slot) in &self.channels {
            let state = slot.state.lock().await;
            levels.insert(*key, state.size as f64 / self.max_size as f64 * 100.0);
            let samples = state.size / 2;
            latencies_ms.insert(*key, samples as f64 / self.sample_rate as f64 * 1000.0);
            if state.size > 0 {
                active_channels.insert(*key);
            }
            metrics.insert(*key, state.metrics.clone());
        }

        BufferStatus {
            levels,
            latencies_ms,
            active_channels,
            metrics,
        }
    }

    /// Discard buffered data for one channel, or every channel.
    pub async fn clear(&self, channel: Option<ChannelKey>) {
        match channel {
            Some(key) => {
                let mut state = self.channels[&key].state.lock().await;
                state.chunks.clear();
                state.size = 0;
            }
            None => {
                for slot in self.channels.values() {
                    let mut state = slot.state.lock().await;
                    state.chunks.clear();
                    state.size = 0;
                }
            }
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Current byte count of one channel, for tests and status checks.
    pub async fn channel_size(&self, channel: ChannelKey) -> usize {
        self.channels[&channel].state.lock().await.size
    }
}
