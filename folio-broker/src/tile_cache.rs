//! Size-bounded cache of rendered tiles with render deduplication.
//!
//! Three tables live here:
//! - rendered tiles keyed by [`TileKey`], each stamped with a wire id,
//! - renders in flight, each with the sessions waiting on it,
//! - small named blobs (status text, command values, font previews).
//!
//! At most one render is in flight per key. A second request for the same
//! key subscribes to the existing render instead of asking the engine again.
//!
//! Eviction is by wire id, oldest first. Wire ids are handed out in
//! insertion order, so this approximates LRU without tracking reads.

use std::collections::HashMap;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::time::Instant;

use crate::protocol::binary_frame;
use crate::session::SessionId;
use crate::tile::{InvalidateRegion, TileBatch, TileDesc, TileKey};

/// Default cache ceiling in bytes.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 512 * 1024;

/// Default age after which an unanswered render may be re-issued.
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can hand a rendered frame to a session.
///
/// Returns `false` when the session is gone, in which case the cache moves on
/// to the next subscriber.
pub trait TileSubscribers {
    fn deliver(&self, session: &SessionId, frame: Vec<u8>) -> bool;
}

/// Category of the auxiliary blob cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Status,
    CommandValues,
    Font,
}

/// Tiles of one combined reply gathered for a single session.
#[derive(Debug, Default)]
struct BatchReply {
    tiles: Vec<TileDesc>,
    data: Vec<u8>,
    first: bool,
}

#[derive(Debug, Clone)]
struct CachedTile {
    data: Vec<u8>,
    wire_id: u64,
}

/// A render the engine has been asked for but not yet answered.
#[derive(Debug, Clone)]
pub struct PendingRender {
    started: Instant,
    version: i32,
    render_id: u64,
    desc: TileDesc,
    subscribers: Vec<SessionId>,
}

impl PendingRender {
    /// The descriptor to send to the engine: newest requested version and the
    /// render id as `wid`.
    pub fn render_desc(&self) -> TileDesc {
        let mut desc = self.desc.clone();
        desc.version = self.version;
        desc.wire_id = self.render_id;
        desc
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn render_id(&self) -> u64 {
        self.render_id
    }

    pub fn subscribers(&self) -> &[SessionId] {
        &self.subscribers
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

/// Per-document tile cache.
pub struct TileCache {
    tiles: HashMap<TileKey, CachedTile>,
    pending: HashMap<TileKey, PendingRender>,
    streams: HashMap<StreamKind, HashMap<String, Vec<u8>>>,
    cache_size: usize,
    max_cache_size: usize,
    render_timeout: Duration,
    next_wire_id: u64,
}

impl TileCache {
    pub fn new(max_cache_size: usize, render_timeout: Duration) -> Self {
        Self {
            tiles: HashMap::new(),
            pending: HashMap::new(),
            streams: HashMap::new(),
            cache_size: 0,
            max_cache_size,
            render_timeout,
            next_wire_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_wire_id += 1;
        self.next_wire_id
    }

    /// Rendered bytes for this tile, if cached.
    pub fn lookup(&self, desc: &TileDesc) -> Option<&[u8]> {
        self.tiles.get(&desc.key()).map(|tile| tile.data.as_slice())
    }

    /// Register `session` as waiting for `desc`.
    ///
    /// Returns `true` when a live render is already in flight and the caller
    /// must not ask the engine again. Returns `false` when the caller has to
    /// issue the render: either nothing was pending or the pending render went
    /// stale. In both cases [`TileCache::pending`] then holds the render id and
    /// version to send.
    pub fn subscribe_to_render(&mut self, desc: &TileDesc, session: SessionId, now: Instant) -> bool {
        let key = desc.key();
        let timeout = self.render_timeout;
        let stale = match self.pending.get_mut(&key) {
            Some(render) => {
                if !render.subscribers.contains(&session) {
                    render.subscribers.push(session);
                }
                render.version = render.version.max(desc.version);
                now.saturating_duration_since(render.started) > timeout
            }
            None => false,
        };
        if stale {
            let fresh_id = self.next_id();
            let Some(render) = self.pending.get_mut(&key) else {
                return false;
            };
            log::debug!(
                "Render {} for part {} at {},{} is stale; re-issuing as {}",
                render.render_id,
                key.part,
                key.tile_pos_x,
                key.tile_pos_y,
                fresh_id
            );
            render.started = now;
            render.render_id = fresh_id;
            return false;
        }
        if self.pending.contains_key(&key) {
            return true;
        }

        let render_id = self.next_id();
        let previous = self.pending.insert(
            key,
            PendingRender {
                started: now,
                version: desc.version,
                render_id,
                desc: desc.clone(),
                subscribers: vec![session],
            },
        );
        debug_assert!(previous.is_none(), "duplicate pending render for {key:?}");
        false
    }

    pub fn pending(&self, key: &TileKey) -> Option<&PendingRender> {
        self.pending.get(key)
    }

    /// Store a rendered tile and send it to everyone waiting for it.
    ///
    /// The first live subscriber gets a plain `tile:` header, later ones get
    /// the same bytes tagged `renderid=cached`. Returns how many sessions the
    /// tile was delivered to.
    pub fn save_and_notify(
        &mut self,
        desc: &TileDesc,
        data: Vec<u8>,
        subscribers: &impl TileSubscribers,
    ) -> usize {
        let key = desc.key();
        let pending = self.pending.remove(&key);

        let mut delivered = 0;
        if let Some(render) = &pending {
            let mut reply = desc.clone();
            reply.version = render.version.max(desc.version);
            reply.img_size = None;
            let fresh = reply.serialize("tile:", "");
            let cached = reply.serialize("tile:", " renderid=cached");
            for session in &render.subscribers {
                let header = if delivered == 0 { &fresh } else { &cached };
                if subscribers.deliver(session, binary_frame(header, &data)) {
                    delivered += 1;
                } else {
                    log::trace!("Tile subscriber {session} is gone; skipping");
                }
            }
        }

        self.insert(key, data);
        self.ensure_cache_size();
        delivered
    }

    /// Store the tiles of one `tilecombine:` engine reply and send every
    /// waiting session a single `tilecombine:` frame with its own tiles.
    ///
    /// A session's frame is tagged `renderid=cached` unless it was the first
    /// subscriber of at least one of those tiles. Returns how many sessions
    /// received a frame.
    pub fn save_and_notify_batch(
        &mut self,
        rendered: Vec<(TileDesc, Vec<u8>)>,
        subscribers: &impl TileSubscribers,
    ) -> usize {
        let mut replies: IndexMap<SessionId, BatchReply> = IndexMap::new();
        for (desc, data) in rendered {
            let key = desc.key();
            if let Some(render) = self.pending.remove(&key) {
                let mut reply = desc.clone();
                reply.version = render.version.max(desc.version);
                reply.img_size = Some(data.len());
                for (i, session) in render.subscribers.iter().enumerate() {
                    let entry = replies.entry(*session).or_default();
                    entry.tiles.push(reply.clone());
                    entry.data.extend_from_slice(&data);
                    entry.first |= i == 0;
                }
            }
            self.insert(key, data);
        }
        self.ensure_cache_size();

        let mut delivered = 0;
        for (session, reply) in replies {
            let batch = match TileBatch::new(reply.tiles) {
                Ok(batch) => batch,
                Err(e) => {
                    log::warn!("Cannot combine tiles for {session}: {e}");
                    continue;
                }
            };
            let suffix = if reply.first { "" } else { " renderid=cached" };
            let header = batch.serialize("tilecombine:", suffix);
            if subscribers.deliver(&session, binary_frame(&header, &reply.data)) {
                delivered += 1;
            } else {
                log::trace!("Tile subscriber {session} is gone; skipping");
            }
        }
        delivered
    }

    fn insert(&mut self, key: TileKey, data: Vec<u8>) {
        let wire_id = self.next_id();
        self.cache_size += data.len();
        if let Some(old) = self.tiles.insert(key, CachedTile { data, wire_id }) {
            self.cache_size -= old.data.len();
        }
    }

    /// Drop `session` from every pending render.
    ///
    /// Renders nobody waits for any more are removed and returned, with
    /// `wire_id` set to their render id, so the engine can be told to skip
    /// them.
    pub fn cancel_subscriptions(&mut self, session: &SessionId) -> Vec<TileDesc> {
        let mut orphaned: Vec<TileDesc> = Vec::new();
        self.pending.retain(|_, render| {
            render.subscribers.retain(|s| s != session);
            if render.subscribers.is_empty() {
                orphaned.push(render.render_desc());
                false
            } else {
                true
            }
        });
        orphaned.sort_by_key(|desc| desc.wire_id);
        orphaned
    }

    /// Remove a pending render without caching anything (the engine
    /// declined it). Returns the render so its subscribers can be told.
    pub fn forget_render(&mut self, key: &TileKey) -> Option<PendingRender> {
        self.pending.remove(key)
    }

    /// Evict every cached tile overlapping `region`. Returns the number of
    /// tiles removed.
    pub fn invalidate(&mut self, region: &InvalidateRegion) -> usize {
        let before = self.tiles.len();
        let mut freed = 0;
        self.tiles.retain(|key, tile| {
            if region.covers(key) {
                freed += tile.data.len();
                false
            } else {
                true
            }
        });
        self.cache_size -= freed;
        before - self.tiles.len()
    }

    /// Trim the cache to three quarters of its ceiling once the ceiling is
    /// exceeded, oldest wire id first. Always keeps at least one tile.
    pub fn ensure_cache_size(&mut self) {
        if self.cache_size <= self.max_cache_size || self.tiles.len() <= 1 {
            return;
        }
        let target = self.max_cache_size / 4 * 3;

        let mut by_age: Vec<(u64, TileKey, usize)> = self
            .tiles
            .iter()
            .map(|(key, tile)| (tile.wire_id, *key, tile.data.len()))
            .collect();
        by_age.sort_unstable_by_key(|(wire_id, _, _)| *wire_id);

        let mut evicted = 0;
        for (_, key, size) in by_age {
            if self.cache_size <= target || self.tiles.len() <= 1 {
                break;
            }
            self.tiles.remove(&key);
            self.cache_size -= size;
            evicted += 1;
        }
        log::debug!(
            "Evicted {evicted} tiles, cache now {} bytes in {} tiles",
            self.cache_size,
            self.tiles.len()
        );
    }

    pub fn save_stream(&mut self, kind: StreamKind, name: &str, data: Vec<u8>) {
        self.streams
            .entry(kind)
            .or_default()
            .insert(name.to_string(), data);
    }

    pub fn lookup_stream(&self, kind: StreamKind, name: &str) -> Option<&[u8]> {
        self.streams
            .get(&kind)
            .and_then(|entries| entries.get(name))
            .map(Vec::as_slice)
    }

    /// Forget everything: tiles, pending renders and streams.
    pub fn clear(&mut self) {
        self.tiles.clear();
        self.pending.clear();
        self.streams.clear();
        self.cache_size = 0;
    }

    /// Total bytes of cached tile data.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHE_SIZE, DEFAULT_RENDER_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;

    use uuid::Uuid;

    use super::*;
    use crate::protocol::{first_line, payload};

    /// Collects frames per session; sessions in `gone` refuse delivery.
    #[derive(Default)]
    struct Inbox {
        frames: RefCell<Vec<(SessionId, Vec<u8>)>>,
        gone: HashSet<SessionId>,
    }

    impl TileSubscribers for Inbox {
        fn deliver(&self, session: &SessionId, frame: Vec<u8>) -> bool {
            if self.gone.contains(session) {
                return false;
            }
            self.frames.borrow_mut().push((*session, frame));
            true
        }
    }

    fn tile_at(x: i32, y: i32) -> TileDesc {
        TileDesc::new(0, 256, 256, x, y, 3840, 3840)
    }

    #[test]
    fn test_lookup_miss_then_hit() {
        let mut cache = TileCache::default();
        let desc = tile_at(0, 0);
        assert!(cache.lookup(&desc).is_none());

        cache.save_and_notify(&desc, vec![1, 2, 3], &Inbox::default());
        assert_eq!(cache.lookup(&desc), Some(&[1u8, 2, 3][..]));
        assert_eq!(cache.cache_size(), 3);

        // Version is not part of the key
        let mut newer = desc.clone();
        newer.version = 12;
        assert_eq!(cache.lookup(&newer), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_single_render_for_concurrent_requests() {
        let mut cache = TileCache::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let desc = tile_at(0, 0);
        let now = Instant::now();

        assert!(!cache.subscribe_to_render(&desc, a, now));
        assert!(cache.subscribe_to_render(&desc, b, now));
        assert_eq!(cache.pending_count(), 1);
        assert_eq!(cache.pending(&desc.key()).unwrap().subscribers(), &[a, b]);

        let inbox = Inbox::default();
        assert_eq!(cache.save_and_notify(&desc, b"X".to_vec(), &inbox), 2);
        assert_eq!(cache.pending_count(), 0);

        let frames = inbox.frames.borrow();
        assert_eq!(frames[0].0, a);
        assert!(!first_line(&frames[0].1).contains("renderid=cached"));
        assert_eq!(payload(&frames[0].1), b"X");
        assert_eq!(frames[1].0, b);
        assert!(first_line(&frames[1].1).ends_with("renderid=cached"));
        assert_eq!(payload(&frames[1].1), b"X");
    }

    #[test]
    fn test_reply_carries_newest_version() {
        let mut cache = TileCache::default();
        let now = Instant::now();
        let mut old = tile_at(0, 0);
        old.version = 3;
        let mut new = old.clone();
        new.version = 8;

        assert!(!cache.subscribe_to_render(&old, Uuid::new_v4(), now));
        assert!(cache.subscribe_to_render(&new, Uuid::new_v4(), now));
        assert_eq!(cache.pending(&old.key()).unwrap().version(), 8);

        let inbox = Inbox::default();
        cache.save_and_notify(&old, vec![0], &inbox);
        let frames = inbox.frames.borrow();
        assert!(first_line(&frames[0].1).contains(" ver=8 "));
    }

    #[test]
    fn test_stale_render_is_reissued() {
        let mut cache = TileCache::new(DEFAULT_MAX_CACHE_SIZE, Duration::from_secs(5));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let desc = tile_at(0, 0);
        let start = Instant::now();

        assert!(!cache.subscribe_to_render(&desc, a, start));
        let first_id = cache.pending(&desc.key()).unwrap().render_id();

        assert!(!cache.subscribe_to_render(&desc, b, start + Duration::from_secs(6)));
        let render = cache.pending(&desc.key()).unwrap();
        assert_ne!(render.render_id(), first_id);
        assert_eq!(render.subscribers(), &[a, b]);
        assert_eq!(render.render_desc().wire_id, render.render_id());
        assert_eq!(cache.pending_count(), 1);
    }

    #[test]
    fn test_batch_reply_is_combined_per_session() {
        let mut cache = TileCache::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Instant::now();
        let left = tile_at(0, 0);
        let right = tile_at(3840, 0);
        cache.subscribe_to_render(&left, a, now);
        cache.subscribe_to_render(&right, a, now);
        cache.subscribe_to_render(&right, b, now);

        let inbox = Inbox::default();
        let rendered = vec![(left.clone(), b"LL".to_vec()), (right.clone(), b"R".to_vec())];
        assert_eq!(cache.save_and_notify_batch(rendered, &inbox), 2);
        assert_eq!(cache.pending_count(), 0);
        assert_eq!(cache.lookup(&right), Some(&b"R"[..]));

        let frames = inbox.frames.borrow();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, a);
        let header = first_line(&frames[0].1);
        assert!(header.starts_with("tilecombine: part=0"));
        assert!(header.contains("tileposx=0,3840 "));
        assert!(header.contains(" imgsize=2,1"));
        assert!(!header.contains("renderid=cached"));
        assert_eq!(payload(&frames[0].1), b"LLR");

        assert_eq!(frames[1].0, b);
        let header = first_line(&frames[1].1);
        assert!(header.contains("tileposx=3840 "));
        assert!(header.ends_with("imgsize=1 renderid=cached"));
        assert_eq!(payload(&frames[1].1), b"R");
    }

    #[test]
    fn test_gone_subscriber_is_skipped() {
        let mut cache = TileCache::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let desc = tile_at(0, 0);
        let now = Instant::now();
        cache.subscribe_to_render(&desc, a, now);
        cache.subscribe_to_render(&desc, b, now);

        let mut inbox = Inbox::default();
        inbox.gone.insert(a);
        assert_eq!(cache.save_and_notify(&desc, vec![7], &inbox), 1);

        // b is now the first live subscriber and gets the plain header
        let frames = inbox.frames.borrow();
        assert_eq!(frames[0].0, b);
        assert!(!first_line(&frames[0].1).contains("renderid=cached"));
    }

    #[test]
    fn test_cancel_subscriptions_returns_orphans() {
        let mut cache = TileCache::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Instant::now();
        let shared = tile_at(0, 0);
        let own_1 = tile_at(3840, 0);
        let own_2 = tile_at(7680, 0);

        cache.subscribe_to_render(&shared, a, now);
        cache.subscribe_to_render(&shared, b, now);
        cache.subscribe_to_render(&own_1, a, now);
        cache.subscribe_to_render(&own_2, a, now);

        let orphans = cache.cancel_subscriptions(&a);
        assert_eq!(orphans.len(), 2);
        assert!(orphans[0].wire_id < orphans[1].wire_id);
        assert_eq!(orphans[0].key(), own_1.key());
        assert_eq!(cache.pending_count(), 1);
        assert_eq!(cache.pending(&shared.key()).unwrap().subscribers(), &[b]);
    }

    #[test]
    fn test_invalidate_removes_only_overlapping() {
        let mut cache = TileCache::default();
        let inbox = Inbox::default();
        let small = |x, y, view| {
            let mut d = TileDesc::new(0, 256, 256, x, y, 50, 50);
            d.view_id = view;
            d
        };
        let inside = small(10, 10, 1);
        let edge = small(99, 0, 1);
        let outside = small(100, 0, 1);
        let other_view = small(10, 10, 2);
        for d in [&inside, &edge, &outside, &other_view] {
            cache.save_and_notify(d, vec![0; 4], &inbox);
        }

        let region = InvalidateRegion {
            part: 0,
            x: 0,
            y: 0,
            width: 100,
            height: 100,
            view_id: 1,
        };
        assert_eq!(cache.invalidate(&region), 2);
        assert!(cache.lookup(&inside).is_none());
        assert!(cache.lookup(&edge).is_none());
        assert!(cache.lookup(&outside).is_some());
        assert!(cache.lookup(&other_view).is_some());
        assert_eq!(cache.cache_size(), 8);

        assert_eq!(cache.invalidate(&InvalidateRegion::everything()), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_eviction_drops_oldest_first() {
        let mut cache = TileCache::new(1000, DEFAULT_RENDER_TIMEOUT);
        let inbox = Inbox::default();
        let tiles: Vec<TileDesc> = (0..5).map(|i| tile_at(i * 3840, 0)).collect();
        for d in &tiles {
            cache.save_and_notify(d, vec![0; 300], &inbox);
        }
        // 4 x 300 = 1200 > 1000 triggered eviction down to <= 750
        assert!(cache.cache_size() <= 1000);
        assert!(cache.lookup(&tiles[0]).is_none());
        assert!(cache.lookup(&tiles[4]).is_some());
    }

    #[test]
    fn test_eviction_keeps_single_oversized_tile() {
        let mut cache = TileCache::new(100, DEFAULT_RENDER_TIMEOUT);
        let inbox = Inbox::default();
        let big = tile_at(0, 0);
        cache.save_and_notify(&big, vec![0; 500], &inbox);
        assert_eq!(cache.len(), 1);

        let next = tile_at(3840, 0);
        cache.save_and_notify(&next, vec![0; 500], &inbox);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&next).is_some());
    }

    #[test]
    fn test_replacing_tile_keeps_size_accurate() {
        let mut cache = TileCache::default();
        let inbox = Inbox::default();
        let desc = tile_at(0, 0);
        cache.save_and_notify(&desc, vec![0; 10], &inbox);
        cache.save_and_notify(&desc, vec![0; 4], &inbox);
        assert_eq!(cache.cache_size(), 4);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_streams_and_clear() {
        let mut cache = TileCache::default();
        cache.save_stream(StreamKind::Status, "status", b"status: type=text".to_vec());
        cache.save_stream(StreamKind::Font, "Liberation|A", vec![9]);
        assert_eq!(
            cache.lookup_stream(StreamKind::Status, "status"),
            Some(&b"status: type=text"[..])
        );
        assert!(cache.lookup_stream(StreamKind::CommandValues, "status").is_none());

        cache.subscribe_to_render(&tile_at(0, 0), Uuid::new_v4(), Instant::now());
        cache.clear();
        assert!(cache.lookup_stream(StreamKind::Font, "Liberation|A").is_none());
        assert_eq!(cache.pending_count(), 0);
    }
}
