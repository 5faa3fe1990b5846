// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The public [`VncServer`] handle: TCP (and optional WebSocket) listener,
//! connection pool, shared framebuffer, and event distribution.
//!
//! One [`Framebuffer`] and its [`TileGrid`](crate::framebuffer::TileGrid)
//! change detector are shared by the whole server, not one per client:
//! [`VncServer::update_framebuffer`] runs the detector exactly once per
//! pushed frame and fans the resulting dirty-region list out to every
//! connected session over a broadcast channel. Each session independently
//! decides what to encode and when to send it, gated by its own
//! `FramebufferUpdateRequest` and throttle state.

use crate::client;
use crate::config::Config;
use crate::error::Result;
use crate::events::{ServerEvent, SessionRecorder};
use crate::framebuffer::{ChangeResult, DirtyRegion, Framebuffer};
use crate::input::InputSink;
use crate::metrics::{Metrics, MetricsSnapshot};
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinSet;

/// Bound on how long [`VncServer::listen`] waits for in-flight sessions to
/// finish after a shutdown is requested, before returning anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the broadcast channel fanning dirty-region notices out to
/// sessions. A session that falls behind by more than this many updates
/// sees a `Lagged` error and resyncs with a full-frame send, so this only
/// trades memory for how much slack a slow client gets before that happens.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the broadcast channel fanning cursor-image pushes out to
/// sessions. Cursor updates are rare compared to framebuffer damage, so a
/// small buffer is enough slack for a momentarily lagging session.
const CURSOR_CHANNEL_CAPACITY: usize = 8;

/// One pushed-frame's worth of change-detector output, broadcast to every
/// session so each can encode and send it in its own negotiated format.
#[derive(Debug, Clone)]
pub(crate) struct UpdateNotice {
    pub regions: Vec<DirtyRegion>,
    pub full_refresh: bool,
    /// Set when this notice is the result of [`VncServer::resize`], so
    /// sessions know to emit a DesktopSize/ExtendedDesktopSize pseudo-
    /// rectangle alongside the ordinary refresh rather than treat this as
    /// just another full-frame resync.
    pub resized: Option<(u16, u16)>,
}

/// A cursor image pushed via [`VncServer::set_cursor`], broadcast to every
/// session for translation into its own negotiated pixel format and
/// delivery as a Cursor (-239) pseudo-encoding rectangle.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CursorImage {
    pub rgba: Vec<u8>,
    pub width: u16,
    pub height: u16,
    pub hotspot_x: u16,
    pub hotspot_y: u16,
}

pub(crate) struct ServerInner {
    pub(crate) config: RwLock<Config>,
    pub(crate) framebuffer: RwLock<Framebuffer>,
    pub(crate) metrics: Metrics,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    pub(crate) updates: broadcast::Sender<UpdateNotice>,
    pub(crate) cursor_updates: broadcast::Sender<CursorImage>,
    pub(crate) recorder: Mutex<Option<Arc<dyn SessionRecorder>>>,
    pub(crate) input_sink: Mutex<Option<Box<dyn InputSink + Send>>>,
    semaphore: Arc<Semaphore>,
    next_client_id: AtomicUsize,
    shutdown: Notify,
}

impl ServerInner {
    fn notify_recorder(&self, event: &ServerEvent) {
        if let Some(recorder) = self.recorder.lock().expect("recorder lock poisoned").as_ref() {
            recorder.record(event);
        }
    }

    /// Notifies the session recorder (if any) and broadcasts `event` to
    /// subscribers. Used by both the accept loop and individual sessions.
    pub(crate) fn publish(&self, event: ServerEvent) {
        self.notify_recorder(&event);
        let _ = self.events.send(event);
    }
}

/// Handle to a running (or not-yet-started) VNC server.
///
/// Cheap to clone: every clone shares the same listener state, framebuffer,
/// and connection pool, the way the teacher crate's original handle did.
pub struct VncServer {
    pub(crate) inner: Arc<ServerInner>,
}

impl Clone for VncServer {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl VncServer {
    /// Creates a server for a `width`×`height` desktop, with default [`Config`].
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        Self::with_config(width, height, Config::default())
    }

    /// Creates a server for a `width`×`height` desktop with an explicit [`Config`].
    #[must_use]
    pub fn with_config(width: u16, height: u16, config: Config) -> Self {
        let (events, _) = broadcast::channel(256);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (cursor_updates, _) = broadcast::channel(CURSOR_CHANNEL_CAPACITY);
        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        let framebuffer = Framebuffer::with_tile_size(width, height, config.tile_size);

        Self {
            inner: Arc::new(ServerInner {
                config: RwLock::new(config),
                framebuffer: RwLock::new(framebuffer),
                metrics: Metrics::new(),
                events,
                updates,
                cursor_updates,
                recorder: Mutex::new(None),
                input_sink: Mutex::new(None),
                semaphore,
                next_client_id: AtomicUsize::new(1),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Sets (or clears) the VNC-Auth password. Takes effect for security
    /// handshakes starting after this call; connections already past their
    /// handshake are unaffected.
    pub fn set_password(&self, password: Option<String>) {
        self.inner.config.write().expect("config lock poisoned").password = password;
    }

    /// Returns a snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        self.inner.config.read().expect("config lock poisoned").clone()
    }

    /// Registers an [`InputSink`] to receive translated pointer/key events
    /// from every connected client. Replaces any previously set sink.
    pub fn set_input_sink<S: InputSink + Send + 'static>(&self, sink: S) {
        *self.inner.input_sink.lock().expect("input sink lock poisoned") = Some(Box::new(sink));
    }

    /// Registers a [`SessionRecorder`] to observe every emitted [`ServerEvent`].
    pub fn set_session_recorder(&self, recorder: Arc<dyn SessionRecorder>) {
        *self.inner.recorder.lock().expect("recorder lock poisoned") = Some(recorder);
    }

    /// Subscribes to the server's event stream. Events published before this
    /// call aren't replayed; call this before [`VncServer::listen`] to avoid
    /// missing early events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Returns a point-in-time snapshot of the server's runtime counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Writes `pixels` (`width * height * 4` RGBA bytes) into the
    /// framebuffer at `(x, y)` and runs change detection; connected
    /// sessions are notified of whatever changed.
    ///
    /// # Panics
    ///
    /// Panics if `pixels.len()` doesn't match `width * height * 4`, or if
    /// the region doesn't fit the framebuffer's current dimensions.
    pub fn update_framebuffer(&self, pixels: &[u8], x: u16, y: u16, width: u16, height: u16) {
        let result = {
            let mut fb = self.inner.framebuffer.write().expect("framebuffer lock poisoned");
            fb.update_region(x, y, width, height, pixels)
        };

        let notice = match result {
            ChangeResult::NoChange => return,
            ChangeResult::FullRefresh => {
                self.inner.metrics.record_full_refresh();
                UpdateNotice { regions: Vec::new(), full_refresh: true, resized: None }
            }
            ChangeResult::Dirty(regions) => UpdateNotice { regions, full_refresh: false, resized: None },
        };

        let _ = self.inner.updates.send(notice);
    }

    /// Resizes the framebuffer, e.g. in response to a desktop-resolution
    /// change upstream of this crate. Every connected session is forced to
    /// resync with a full-frame refresh on its next update, and clients
    /// that advertised DesktopSize or ExtendedDesktopSize are sent the
    /// matching pseudo-encoding rectangle alongside it.
    pub fn resize(&self, width: u16, height: u16) {
        self.inner.framebuffer.write().expect("framebuffer lock poisoned").resize(width, height);
        let _ = self.inner.updates.send(UpdateNotice { regions: Vec::new(), full_refresh: true, resized: Some((width, height)) });
    }

    /// Pushes a new cursor image to every connected session, translated
    /// into each client's own negotiated pixel format and delivered as a
    /// Cursor (-239) pseudo-encoding rectangle, but only to clients that
    /// advertised support for it in `SetEncodings`.
    ///
    /// `hotspot_x`/`hotspot_y` locate the cursor's hot pixel within the
    /// `width`x`height` image, per RFC 6143 §7.7.2.
    ///
    /// # Panics
    ///
    /// Panics if `rgba.len()` doesn't equal `width * height * 4`.
    pub fn set_cursor(&self, rgba: &[u8], width: u16, height: u16, hotspot_x: u16, hotspot_y: u16) {
        assert_eq!(rgba.len(), width as usize * height as usize * 4, "cursor image must be width*height RGBA32 bytes");
        let image = CursorImage { rgba: rgba.to_vec(), width, height, hotspot_x, hotspot_y };
        let _ = self.inner.cursor_updates.send(image);
    }

    /// Signals [`VncServer::listen`] to stop accepting new connections and
    /// begin its graceful drain.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_waiters();
    }

    /// Binds `port` on the configured listen address and serves connections
    /// until [`VncServer::shutdown`] is called, draining in-flight sessions
    /// (up to [`SHUTDOWN_GRACE`]) before returning.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::VncError::Transport`] if the listener can't be bound.
    pub async fn listen(&self, port: u16) -> Result<()> {
        let host = self.inner.config.read().expect("config lock poisoned").listen_host.clone();
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr).await?;
        info!("rustvncserver listening on {addr}");

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.dispatch(stream, peer, &mut sessions),
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                () = self.inner.shutdown.notified() => {
                    info!("shutdown requested, draining {} active session(s)", sessions.len());
                    break;
                }
            }
        }

        drop(listener);
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        Ok(())
    }

    fn dispatch(&self, stream: tokio::net::TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        let permit = match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.metrics.record_connection_rejected();
                warn!("rejecting {peer}: at max_connections, closing without handshake");
                return;
            }
        };

        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let server = self.clone();

        sessions.spawn(async move {
            let _permit = permit;
            server.inner.metrics.record_connection_accepted();
            server.inner.publish(ServerEvent::ClientConnected { id, address: peer });

            match client::run_session(id, stream, peer, Arc::clone(&server.inner)).await {
                Ok(()) => info!("client {id} ({peer}) session ended"),
                Err(e) if e.is_peer_disconnect() => info!("client {id} ({peer}) disconnected: {e}"),
                Err(e) => warn!("client {id} ({peer}) session error: {e}"),
            }

            server.inner.metrics.record_connection_closed();
            server.inner.publish(ServerEvent::ClientDisconnected { id });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_server_starts_with_zero_active_connections() {
        let server = VncServer::new(640, 480);
        assert_eq!(server.metrics().connections_active, 0);
    }

    #[test]
    fn set_password_is_visible_through_config() {
        let server = VncServer::new(640, 480);
        server.set_password(Some("secret".to_string()));
        assert_eq!(server.config().password.as_deref(), Some("secret"));
    }

    #[test]
    fn clone_shares_the_same_framebuffer() {
        let server = VncServer::new(4, 4);
        let clone = server.clone();
        clone.update_framebuffer(&[1, 2, 3, 4], 0, 0, 1, 1);
        let pixels = server.inner.framebuffer.read().unwrap().pixels().to_vec();
        assert_eq!(&pixels[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn update_framebuffer_with_no_change_does_not_panic() {
        let server = VncServer::new(2, 2);
        server.update_framebuffer(&[0u8; 16], 0, 0, 2, 2);
        server.update_framebuffer(&[0u8; 16], 0, 0, 2, 2); // identical frame again
    }

    #[test]
    fn resize_marks_the_notice_as_resized() {
        let server = VncServer::new(640, 480);
        let mut rx = server.inner.updates.subscribe();
        server.resize(800, 600);
        let notice = rx.try_recv().expect("resize should broadcast a notice");
        assert!(notice.full_refresh);
        assert_eq!(notice.resized, Some((800, 600)));
    }

    #[test]
    fn set_cursor_broadcasts_the_image_to_subscribers() {
        let server = VncServer::new(640, 480);
        let mut rx = server.inner.cursor_updates.subscribe();
        server.set_cursor(&[0xFFu8; 2 * 2 * 4], 2, 2, 1, 1);
        let image = rx.try_recv().expect("set_cursor should broadcast an image");
        assert_eq!((image.width, image.height, image.hotspot_x, image.hotspot_y), (2, 2, 1, 1));
    }

    #[test]
    #[should_panic(expected = "cursor image must be width*height RGBA32 bytes")]
    fn set_cursor_panics_on_mismatched_buffer_length() {
        let server = VncServer::new(640, 480);
        server.set_cursor(&[0xFFu8; 3], 2, 2, 0, 0);
    }
}
