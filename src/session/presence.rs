//! Presence and live cursors
//!
//! Presence is ephemeral: it travels over a per-tree channel and never
//! touches the entity store. `PresenceChannel` is the transport seam;
//! `PresenceHub` is the in-process implementation. `PresenceBroadcaster`
//! publishes this user's cursor and turns channel snapshots into peers.

use super::UserIdentity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

const PALETTE: [&str; 11] = [
    "#ef4444", "#f97316", "#f59e0b", "#84cc16", "#10b981", "#06b6d4", "#3b82f6", "#6366f1",
    "#8b5cf6", "#d946ef", "#ec4899",
];

const ICONS: [&str; 7] = ["puck", "stick", "skate", "goal", "whistle", "helmet", "glove"];

/// Where a freshly joined user's cursor sits until it first moves
const OFF_SCREEN: f64 = -100.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("presence channel is closed")]
    ChannelClosed,

    #[error("not joined to channel {0}")]
    NotJoined(String),
}

pub type PresenceResult<T> = Result<T, PresenceError>;

/// What one user publishes on the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    pub online_at: DateTime<Utc>,
}

impl PresencePayload {
    /// Name, else the e-mail local part, else "User"
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|local| !local.is_empty())
            .unwrap_or("User")
            .to_string()
    }
}

/// Full channel state: presence key to that key's tracked payloads
pub type PresenceState = BTreeMap<String, Vec<PresencePayload>>;

/// A joined channel membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceHandle {
    pub channel: String,
    pub presence_key: String,
    id: u64,
}

/// Presence transport
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn join(&self, channel: &str, presence_key: &str) -> PresenceResult<PresenceHandle>;

    /// Publish (or replace) this member's payload
    async fn track(&self, handle: &PresenceHandle, payload: PresencePayload) -> PresenceResult<()>;

    /// Retract this member's payload without leaving
    async fn untrack(&self, handle: &PresenceHandle) -> PresenceResult<()>;

    /// Snapshots of the full channel state, updated on every change
    fn on_sync(&self, handle: &PresenceHandle) -> PresenceResult<watch::Receiver<PresenceState>>;

    async fn leave(&self, handle: PresenceHandle) -> PresenceResult<()>;
}

struct Room {
    tx: watch::Sender<PresenceState>,
    members: HashMap<u64, (String, Option<PresencePayload>)>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = watch::channel(PresenceState::new());
        Self {
            tx,
            members: HashMap::new(),
        }
    }

    fn publish(&self) {
        let mut state = PresenceState::new();
        let mut ids: Vec<&u64> = self.members.keys().collect();
        ids.sort();
        for id in ids {
            if let Some((key, Some(payload))) = self.members.get(id) {
                state.entry(key.clone()).or_default().push(payload.clone());
            }
        }
        self.tx.send_replace(state);
    }
}

/// In-process presence transport shared by every session of a process
#[derive(Default)]
pub struct PresenceHub {
    rooms: DashMap<String, Room>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every further operation
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> PresenceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PresenceError::ChannelClosed);
        }
        Ok(())
    }

    fn with_member<T>(
        &self,
        handle: &PresenceHandle,
        f: impl FnOnce(&mut Room) -> T,
    ) -> PresenceResult<T> {
        self.ensure_open()?;
        let mut room = self
            .rooms
            .get_mut(&handle.channel)
            .ok_or_else(|| PresenceError::NotJoined(handle.channel.clone()))?;
        if !room.members.contains_key(&handle.id) {
            return Err(PresenceError::NotJoined(handle.channel.clone()));
        }
        Ok(f(&mut room))
    }
}

#[async_trait]
impl PresenceChannel for PresenceHub {
    async fn join(&self, channel: &str, presence_key: &str) -> PresenceResult<PresenceHandle> {
        self.ensure_open()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rooms
            .entry(channel.to_string())
            .or_insert_with(Room::new)
            .members
            .insert(id, (presence_key.to_string(), None));
        Ok(PresenceHandle {
            channel: channel.to_string(),
            presence_key: presence_key.to_string(),
            id,
        })
    }

    async fn track(&self, handle: &PresenceHandle, payload: PresencePayload) -> PresenceResult<()> {
        self.with_member(handle, |room| {
            if let Some(member) = room.members.get_mut(&handle.id) {
                member.1 = Some(payload);
            }
            room.publish();
        })
    }

    async fn untrack(&self, handle: &PresenceHandle) -> PresenceResult<()> {
        self.with_member(handle, |room| {
            if let Some(member) = room.members.get_mut(&handle.id) {
                member.1 = None;
            }
            room.publish();
        })
    }

    fn on_sync(&self, handle: &PresenceHandle) -> PresenceResult<watch::Receiver<PresenceState>> {
        self.with_member(handle, |room| room.tx.subscribe())
    }

    async fn leave(&self, handle: PresenceHandle) -> PresenceResult<()> {
        self.with_member(&handle, |room| {
            room.members.remove(&handle.id);
            room.publish();
        })?;
        self.rooms
            .remove_if(&handle.channel, |_, room| room.members.is_empty());
        Ok(())
    }
}

/// Stable colour and icon of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerStyle {
    pub color: &'static str,
    pub icon: &'static str,
}

/// Same user id, same style, in every session and regardless of join order.
///
/// Multiplies by 31 over UTF-16 units. Only the shift is taken in 32 bits;
/// the add and subtract run on the wide accumulator, so long ids keep
/// growing past `i32` instead of wrapping.
pub fn peer_style(user_id: &str) -> PeerStyle {
    let hash = user_id
        .encode_utf16()
        .fold(0i64, |hash, unit| {
            let shifted = i64::from((hash as i32).wrapping_shl(5));
            i64::from(unit).wrapping_add(shifted.wrapping_sub(hash))
        })
        .unsigned_abs() as usize;
    PeerStyle {
        color: PALETTE[hash % PALETTE.len()],
        icon: ICONS[hash % ICONS.len()],
    }
}

/// Another user's cursor, ready to draw
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerCursor {
    pub user_id: String,
    pub x: f64,
    pub y: f64,
    pub display_name: String,
    pub style: PeerStyle,
}

/// Another user with the tree open
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Viewer {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub online_at: DateTime<Utc>,
}

/// Presence channel name of a tree
pub fn channel_key(tree_id: &str) -> String {
    format!("cursor-presence-{}", tree_id)
}

/// This user's presence on one tree
pub struct PresenceBroadcaster {
    channel: Arc<dyn PresenceChannel>,
    handle: PresenceHandle,
    user: UserIdentity,
    online_at: DateTime<Utc>,
    sync: watch::Receiver<PresenceState>,
    throttle: Duration,
    last_publish: Mutex<Option<Instant>>,
}

impl PresenceBroadcaster {
    /// Join the tree's channel and announce this user with an off-screen cursor
    pub async fn join(
        channel: Arc<dyn PresenceChannel>,
        tree_id: &str,
        user: UserIdentity,
        throttle: Duration,
    ) -> PresenceResult<Self> {
        let handle = channel.join(&channel_key(tree_id), &user.id).await?;
        let sync = channel.on_sync(&handle)?;
        let broadcaster = Self {
            channel,
            handle,
            user,
            online_at: Utc::now(),
            sync,
            throttle,
            last_publish: Mutex::new(None),
        };
        broadcaster
            .channel
            .track(&broadcaster.handle, broadcaster.payload(OFF_SCREEN, OFF_SCREEN))
            .await?;
        info!(tree = tree_id, user = %broadcaster.user.id, "joined presence");
        Ok(broadcaster)
    }

    fn payload(&self, x: f64, y: f64) -> PresencePayload {
        PresencePayload {
            user_id: self.user.id.clone(),
            name: self.user.name.clone(),
            email: self.user.email.clone(),
            x: Some(x),
            y: Some(y),
            online_at: self.online_at,
        }
    }

    /// Publish a cursor position unless one went out within the throttle
    /// window. Returns whether it was published.
    pub async fn move_cursor(&self, x: f64, y: f64) -> PresenceResult<bool> {
        {
            let mut last = self.last_publish.lock().unwrap();
            let now = Instant::now();
            if let Some(at) = *last {
                if now.duration_since(at) < self.throttle {
                    debug!("cursor move throttled");
                    return Ok(false);
                }
            }
            *last = Some(now);
        }
        self.channel.track(&self.handle, self.payload(x, y)).await?;
        Ok(true)
    }

    /// Cursors of everyone else that have a position, ordered by user id
    pub fn peers(&self) -> Vec<PeerCursor> {
        let state = self.sync.borrow();
        state
            .iter()
            .filter(|(key, _)| *key != &self.user.id)
            .filter_map(|(key, payloads)| {
                let payload = payloads.first()?;
                Some(PeerCursor {
                    user_id: key.clone(),
                    x: payload.x?,
                    y: payload.y?,
                    display_name: payload.display_name(),
                    style: peer_style(key),
                })
            })
            .collect()
    }

    /// Everyone else present, cursor or not
    pub fn viewers(&self) -> Vec<Viewer> {
        let state = self.sync.borrow();
        state
            .iter()
            .filter(|(key, _)| *key != &self.user.id)
            .filter_map(|(key, payloads)| {
                let payload = payloads.first()?;
                Some(Viewer {
                    user_id: key.clone(),
                    display_name: payload.display_name(),
                    email: payload.email.clone(),
                    online_at: payload.online_at,
                })
            })
            .collect()
    }

    /// A receiver that wakes on every snapshot
    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.sync.clone()
    }

    /// Retract presence, then leave the channel
    pub async fn leave(self) -> PresenceResult<()> {
        self.channel.untrack(&self.handle).await?;
        self.channel.leave(self.handle).await?;
        info!(user = %self.user.id, "left presence");
        Ok(())
    }
}
