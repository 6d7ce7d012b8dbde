//! Observability and Metrics
//!
//! Per-connection counters for frames, bytes and dispatch outcomes.
//! Uses atomic counters so the send loop, the receive loop and callers can
//! record concurrently without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for one connection
#[derive(Debug)]
pub struct ConnectionMetrics {
    /// Frames written to the socket
    pub frames_sent: AtomicU64,
    /// Frames decoded from the socket
    pub frames_received: AtomicU64,
    /// Bytes written, headers included
    pub bytes_sent: AtomicU64,
    /// Bytes read, headers included
    pub bytes_received: AtomicU64,
    /// Frames handed to another peer by a reroute rule
    pub frames_rerouted: AtomicU64,
    /// Frames with no registration or a malformed payload
    pub undefined_packets: AtomicU64,
    /// Responses matched to a pending request
    pub requests_completed: AtomicU64,
    /// Inbound property writes applied
    pub properties_synced: AtomicU64,
    /// Read errors the receive loop recovered from
    pub transient_read_errors: AtomicU64,
    /// Frames still queued when the send loop stopped
    pub frames_dropped: AtomicU64,
    start_time: Instant,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_rerouted: AtomicU64::new(0),
            undefined_packets: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            properties_synced: AtomicU64::new(0),
            transient_read_errors: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a frame sent
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_rerouted(&self) {
        self.frames_rerouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn undefined_packet(&self) {
        self.undefined_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn property_synced(&self) {
        self.properties_synced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transient_read_error(&self) {
        self.transient_read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_rerouted: self.frames_rerouted.load(Ordering::Relaxed),
            undefined_packets: self.undefined_packets.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            properties_synced: self.properties_synced.load(Ordering::Relaxed),
            transient_read_errors: self.transient_read_errors.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_summary(&self, client_id: u8) {
        let snapshot = self.snapshot();
        info!(
            client_id,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            frames_rerouted = snapshot.frames_rerouted,
            undefined_packets = snapshot.undefined_packets,
            requests_completed = snapshot.requests_completed,
            properties_synced = snapshot.properties_synced,
            transient_read_errors = snapshot.transient_read_errors,
            frames_dropped = snapshot.frames_dropped,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_rerouted: u64,
    pub undefined_packets: u64,
    pub requests_completed: u64,
    pub properties_synced: u64,
    pub transient_read_errors: u64,
    pub frames_dropped: u64,
    pub uptime_seconds: u64,
}
