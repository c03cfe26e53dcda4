//! Text datagram channels.
//!
//! The protocol only assumes a channel that can carry short text
//! frames with no ordering or delivery guarantee. [`MemoryChannel`]
//! is the in-process implementation used by [`crate::Net`] and the
//! tests; it delivers reliably but enforces the frame size cap, so
//! everything above it still has to chunk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::error::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Close,
}

/// One end of an unordered text channel.
pub trait DataChannel: Send + Sync + 'static {
    fn send(&self, text: &str) -> Result<(), ChannelError>;
    fn close(&self);
    /// Largest text frame `send` accepts.
    fn max_frame_len(&self) -> usize;
}

struct MemoryShared {
    closed: AtomicBool,
}

/// Delivery fault injection for a [`MemoryChannel`] pair. Frames are
/// held back in a window and released in random order; `drop_rate`
/// loses frames outright.
#[derive(Debug, Clone)]
pub struct Chaos {
    pub reorder_window: usize,
    pub drop_rate: f64,
    pub seed: u64,
}

impl Chaos {
    pub fn reorder_only(window: usize, seed: u64) -> Chaos {
        Chaos {
            reorder_window: window,
            drop_rate: 0.0,
            seed,
        }
    }
}

struct ChaosState {
    reorder_window: usize,
    drop_rate: f64,
    rng: StdRng,
    held: Vec<String>,
}

/// In-process channel end. Events for the other end go straight into
/// its queue; `pair` hands back both ends with their receivers.
#[derive(Clone)]
pub struct MemoryChannel {
    mtu: usize,
    to_remote: mpsc::UnboundedSender<ChannelEvent>,
    to_local: mpsc::UnboundedSender<ChannelEvent>,
    shared: Arc<MemoryShared>,
    chaos: Option<Arc<Mutex<ChaosState>>>,
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

impl MemoryChannel {
    pub fn pair(mtu: usize) -> ((MemoryChannel, ChannelEvents), (MemoryChannel, ChannelEvents)) {
        Self::build(mtu, None)
    }

    /// A pair whose frames can arrive reordered or not at all.
    pub fn chaotic_pair(
        mtu: usize,
        chaos: Chaos,
    ) -> ((MemoryChannel, ChannelEvents), (MemoryChannel, ChannelEvents)) {
        Self::build(mtu, Some(chaos))
    }

    fn build(
        mtu: usize,
        chaos: Option<Chaos>,
    ) -> ((MemoryChannel, ChannelEvents), (MemoryChannel, ChannelEvents)) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MemoryShared {
            closed: AtomicBool::new(false),
        });
        let state = |bump: u64| {
            chaos.as_ref().map(|x| {
                Arc::new(Mutex::new(ChaosState {
                    reorder_window: x.reorder_window,
                    drop_rate: x.drop_rate,
                    rng: StdRng::seed_from_u64(x.seed.wrapping_add(bump)),
                    held: Vec::new(),
                }))
            })
        };
        let a = MemoryChannel {
            mtu,
            to_remote: b_tx.clone(),
            to_local: a_tx.clone(),
            shared: shared.clone(),
            chaos: state(0),
        };
        let b = MemoryChannel {
            mtu,
            to_remote: a_tx,
            to_local: b_tx,
            shared,
            chaos: state(1),
        };
        ((a, a_rx), (b, b_rx))
    }

    fn deliver(&self, text: String) -> Result<(), ChannelError> {
        self.to_remote
            .send(ChannelEvent::Message(text))
            .map_err(|_| ChannelError::Closed)
    }

    fn flush_held(&self) {
        if let Some(chaos) = &self.chaos {
            let held = std::mem::take(&mut chaos.lock().unwrap().held);
            for text in held {
                let _ = self.deliver(text);
            }
        }
    }

    /// Fires `Open` at both ends. Called by the rendezvous once the
    /// answer has been applied.
    pub fn open(&self) {
        let _ = self.to_local.send(ChannelEvent::Open);
        let _ = self.to_remote.send(ChannelEvent::Open);
    }
}

impl DataChannel for MemoryChannel {
    fn send(&self, text: &str) -> Result<(), ChannelError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if text.len() > self.mtu {
            return Err(ChannelError::FrameTooLarge {
                len: text.len(),
                max: self.mtu,
            });
        }
        let release = match &self.chaos {
            None => Some(text.to_string()),
            Some(chaos) => {
                let mut chaos = chaos.lock().unwrap();
                if chaos.rng.gen::<f64>() < chaos.drop_rate {
                    // Lost in transit, the sender never learns
                    return Ok(());
                }
                chaos.held.push(text.to_string());
                if chaos.held.len() > chaos.reorder_window {
                    let len = chaos.held.len();
                    let i = chaos.rng.gen_range(0..len);
                    Some(chaos.held.swap_remove(i))
                } else {
                    None
                }
            }
        };
        match release {
            Some(text) => self.deliver(text),
            None => Ok(()),
        }
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush_held();
        let _ = self.to_local.send(ChannelEvent::Close);
        let _ = self.to_remote.send(ChannelEvent::Close);
    }

    fn max_frame_len(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_cross_the_pair() {
        let ((a, _a_rx), (_b, mut b_rx)) = MemoryChannel::pair(64);
        a.send("hello").unwrap();
        assert_eq!(b_rx.recv().await, Some(ChannelEvent::Message("hello".into())));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let ((a, _a_rx), _b) = MemoryChannel::pair(4);
        assert!(matches!(
            a.send("too long"),
            Err(ChannelError::FrameTooLarge { len: 8, max: 4 })
        ));
    }

    #[tokio::test]
    async fn reordering_still_delivers_everything() {
        let ((a, _a_rx), (_b, mut b_rx)) =
            MemoryChannel::chaotic_pair(64, Chaos::reorder_only(4, 7));
        let mut sent: Vec<String> = (0..10).map(|n| format!("frame {n}")).collect();
        for s in &sent {
            a.send(s).unwrap();
        }
        // Close flushes whatever the window still holds
        a.close();

        let mut got = Vec::new();
        while let Some(event) = b_rx.recv().await {
            match event {
                ChannelEvent::Message(x) => got.push(x),
                ChannelEvent::Close => break,
                ChannelEvent::Open => {}
            }
        }
        got.sort();
        sent.sort();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn close_reaches_both_ends_once() {
        let ((a, mut a_rx), (b, mut b_rx)) = MemoryChannel::pair(64);
        a.close();
        a.close();
        assert_eq!(a_rx.recv().await, Some(ChannelEvent::Close));
        assert_eq!(b_rx.recv().await, Some(ChannelEvent::Close));
        assert!(matches!(b.send("late"), Err(ChannelError::Closed)));
    }
}
