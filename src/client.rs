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

//! Per-connection session: transport negotiation, the version/security
//! handshake, and the encode-and-send loop that runs for the life of one
//! client.
//!
//! One [`run_session`] call owns one socket from accept to disconnect.
//! There is no per-client task beyond this one: everything it needs
//! (framebuffer, change-detection notices, metrics, event fan-out) comes
//! from the shared [`ServerInner`], and everything it owns (pixel format,
//! advertised encodings, persistent zlib streams) lives in [`ClientState`]
//! on its own stack.

use crate::auth::VncAuth;
use crate::config::Config;
use crate::encoding::copyrect::{self, ShiftMatch};
use crate::encoding::{self, tight, zrle, ContentHint, EncoderManager};
use crate::error::{Result, VncError};
use crate::events::ServerEvent;
use crate::framebuffer::DirtyRegion;
use crate::input::InputTranslator;
use crate::protocol::{
    self, ClientMessage, PixelFormat, Rectangle, RfbVersion, ServerInit, ENCODING_COPYRECT,
    ENCODING_CURSOR, ENCODING_DESKTOP_SIZE, ENCODING_EXTENDED_DESKTOP_SIZE, ENCODING_RAW,
    ENCODING_TIGHT, ENCODING_ZRLE, PROTOCOL_VERSION, SECURITY_RESULT_FAILED, SECURITY_RESULT_OK,
    SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH, SERVER_MSG_FRAMEBUFFER_UPDATE,
};
use crate::server::{CursorImage, ServerInner};
use crate::translate::TranslationCache;
use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression};
use log::warn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::websocket::{self, WebSocketStream};

/// TCP writes larger than this are chunked, so one slow client sharing a
/// link with others doesn't hold a single oversized `write_all` for long.
const WRITE_CHUNK_BYTES: usize = 256 * 1024;
const CHUNK_THRESHOLD_BYTES: usize = 1024 * 1024;

/// Bound on the HTTP request head read while sniffing for a WebSocket
/// upgrade, so a client that never sends `\r\n\r\n` can't grow this buffer
/// unbounded.
const MAX_WS_REQUEST_HEAD: usize = 8192;

/// Unifies plain TCP and WebSocket-framed I/O behind one read/write
/// surface, so the rest of the session loop doesn't care which transport
/// carries the RFB byte stream.
enum Transport {
    Tcp(TcpStream),
    WebSocket(WebSocketStream<TcpStream>),
}

impl Transport {
    async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize> {
        match self {
            Transport::Tcp(stream) => Ok(stream.read_buf(buf).await?),
            Transport::WebSocket(ws) => {
                let message = ws.read_message().await?;
                let len = message.len();
                buf.extend_from_slice(&message);
                Ok(len)
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(stream) => {
                if data.len() > CHUNK_THRESHOLD_BYTES {
                    for chunk in data.chunks(WRITE_CHUNK_BYTES) {
                        stream.write_all(chunk).await?;
                    }
                } else {
                    stream.write_all(data).await?;
                }
                Ok(())
            }
            Transport::WebSocket(ws) => ws.write_message(data).await,
        }
    }
}

/// Reads from `transport` into `buf` until at least `n` bytes are
/// available, for the fixed-size reads of the handshake (the session
/// loop past `ClientInit` instead parses incrementally from a growing
/// buffer, since message boundaries there aren't known up front).
async fn fill(transport: &mut Transport, buf: &mut BytesMut, n: usize) -> Result<()> {
    while buf.len() < n {
        let read = transport.read_into(buf).await?;
        if read == 0 {
            return Err(VncError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection during the handshake",
            )));
        }
    }
    Ok(())
}

/// Peeks the first bytes of a fresh connection and, if they look like an
/// HTTP upgrade request and WebSocket support is enabled, completes the
/// RFC 6455 handshake and wraps the socket; otherwise returns it as plain
/// TCP untouched.
async fn negotiate_transport(mut stream: TcpStream, config: &Config) -> Result<Transport> {
    if !config.websocket_enabled {
        return Ok(Transport::Tcp(stream));
    }

    let mut peek_buf = [0u8; websocket::DETECTION_PEEK_LEN];
    let peeked = stream.peek(&mut peek_buf).await?;
    if !websocket::looks_like_websocket(&peek_buf[..peeked]) {
        return Ok(Transport::Tcp(stream));
    }

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.map_err(|_| {
            VncError::Protocol("WebSocket handshake: connection closed mid-request".to_string())
        })?;
        head.push(byte[0]);
        if head.len() >= 4 && head[head.len() - 4..] == *b"\r\n\r\n" {
            break;
        }
        if head.len() > MAX_WS_REQUEST_HEAD {
            return Err(VncError::Protocol("WebSocket handshake request head too large".to_string()));
        }
    }

    let request_head = String::from_utf8_lossy(&head).into_owned();
    let subprotocol = websocket::handshake(&mut stream, &request_head).await?;
    Ok(Transport::WebSocket(WebSocketStream::new(stream, subprotocol, config.websocket_max_payload_bytes)))
}

/// Coarse classification of a peer's network distance, driving
/// [`derive_hint`]'s choice of [`ContentHint::Lan`] over bandwidth-aware
/// hints that only make sense for a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetworkProfile {
    Localhost,
    Lan,
    Wan,
}

fn classify_peer(peer: SocketAddr) -> NetworkProfile {
    match peer.ip() {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                NetworkProfile::Localhost
            } else if v4.is_private() || v4.is_link_local() {
                NetworkProfile::Lan
            } else {
                NetworkProfile::Wan
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                NetworkProfile::Localhost
            } else if is_unique_local(v6) || v6.is_unicast_link_local() {
                NetworkProfile::Lan
            } else {
                NetworkProfile::Wan
            }
        }
    }
}

fn is_unique_local(v6: std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

/// One in-flight `FramebufferUpdateRequest`, held until there's something
/// to answer it with.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    x: u16,
    y: u16,
    width: u16,
    height: u16,
    incremental: bool,
}

/// Everything this session remembers about its client: negotiated wire
/// format, accumulated damage since the last send, and the persistent
/// compressor state ZRLE and Tight carry across rectangles for the life
/// of the connection.
struct ClientState {
    pixel_format: PixelFormat,
    encodings: Vec<i32>,
    pending_request: Option<PendingRequest>,
    dirty: Vec<DirtyRegion>,
    full_refresh_pending: bool,
    last_full_frame: Option<Vec<u8>>,
    zrle_compressor: Compress,
    tight_streams: tight::TightStreams,
    /// Set by a [`crate::server::VncServer::resize`] notice; consumed by
    /// the next `send_update` as a DesktopSize/ExtendedDesktopSize
    /// pseudo-rectangle, if the client advertised support for one.
    pending_resize: bool,
    /// The framebuffer size last announced to this client, either via
    /// `ServerInit` or a DesktopSize pseudo-rectangle.
    last_desktop_size_sent: (u16, u16),
    /// A cursor image pushed via `VncServer::set_cursor` and not yet sent.
    pending_cursor: Option<CursorImage>,
    /// The last cursor image actually sent to this client, so a repeated
    /// push of the same image doesn't re-send a redundant rectangle.
    last_cursor_sent: Option<CursorImage>,
}

impl ClientState {
    fn new(zlib_level: u8, width: u16, height: u16) -> Self {
        Self {
            pixel_format: PixelFormat::bgr0(),
            encodings: Vec::new(),
            pending_request: None,
            dirty: Vec::new(),
            full_refresh_pending: true,
            last_full_frame: None,
            zrle_compressor: Compress::new(Compression::new(u32::from(zlib_level)), true),
            tight_streams: tight::TightStreams::new(zlib_level),
            pending_resize: false,
            last_desktop_size_sent: (width, height),
            pending_cursor: None,
            last_cursor_sent: None,
        }
    }

    /// A pixel-format change invalidates any in-flight compressor state
    /// (ZRLE and Tight both encode relative to the current format) and
    /// forces a full resync so the client never sees a frame half-encoded
    /// in the old format.
    fn reset_on_format_change(&mut self, zlib_level: u8) {
        self.zrle_compressor = Compress::new(Compression::new(u32::from(zlib_level)), true);
        self.tight_streams.reset(zlib_level);
        self.full_refresh_pending = true;
        self.dirty.clear();
        self.last_full_frame = None;
    }
}

/// Drives one client connection from the version handshake through
/// disconnect. Spawned by [`crate::server::VncServer`]'s accept loop,
/// one per accepted socket.
pub(crate) async fn run_session(
    id: usize,
    stream: TcpStream,
    peer: SocketAddr,
    inner: Arc<ServerInner>,
) -> Result<()> {
    let config = inner.config.read().expect("config lock poisoned").clone();
    let mut transport = negotiate_transport(stream, &config).await?;
    let mut buf = BytesMut::new();

    transport.write_all(PROTOCOL_VERSION.as_bytes()).await?;
    fill(&mut transport, &mut buf, 12).await?;
    let version_line = buf.split_to(12);
    let version = RfbVersion::parse(&version_line)?;

    perform_security_handshake(&mut transport, &mut buf, version, &config, &inner).await?;

    fill(&mut transport, &mut buf, 1).await?;
    buf.advance(1); // ClientInit shared-flag: the framebuffer is shared either way

    let (width, height) = {
        let fb = inner.framebuffer.read().expect("framebuffer lock poisoned");
        (fb.width(), fb.height())
    };

    let server_init = ServerInit {
        framebuffer_width: width,
        framebuffer_height: height,
        pixel_format: PixelFormat::bgr0(),
        name: config.desktop_name.clone(),
    };
    let mut init_out = BytesMut::new();
    server_init.write_to(&mut init_out);
    transport.write_all(&init_out).await?;

    let mut state = ClientState::new(config.zlib_compression_level, width, height);
    let mut input_translator = InputTranslator::new(width, height, config.scale_factor);
    let mut updates_rx = inner.updates.subscribe();
    let mut cursor_rx = inner.cursor_updates.subscribe();
    let translation_cache = TranslationCache::new();
    let profile = classify_peer(peer);

    let idle_timeout = Duration::from_secs(config.idle_timeout_s.max(1));
    let fps = config.max_fps.max(1);
    let mut throttle = interval(Duration::from_secs_f64(1.0 / f64::from(fps)));
    throttle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            read_result = timeout(idle_timeout, transport.read_into(&mut buf)) => {
                let n = read_result
                    .map_err(|_| VncError::Transport(io::Error::new(io::ErrorKind::TimedOut, "idle timeout exceeded")))??;
                if n == 0 {
                    return Ok(());
                }
                inner.metrics.add_bytes_received(n as u64);

                'messages: loop {
                    let Some(msg) = protocol::parse_client_message(
                        &mut buf,
                        config.max_client_cut_text_bytes,
                        config.max_set_encodings,
                    )? else { break };

                    match msg {
                        // Coalesce a run of already-buffered PointerEvents: a
                        // fast-moving client can queue many moves per read,
                        // and only the most recent position/button state
                        // matters once a fresher one has arrived.
                        ClientMessage::PointerEvent { mut button_mask, mut x, mut y } => {
                            loop {
                                match protocol::parse_client_message(
                                    &mut buf,
                                    config.max_client_cut_text_bytes,
                                    config.max_set_encodings,
                                )? {
                                    Some(ClientMessage::PointerEvent { button_mask: next_mask, x: next_x, y: next_y }) => {
                                        button_mask = next_mask;
                                        x = next_x;
                                        y = next_y;
                                    }
                                    Some(other) => {
                                        handle_client_message(
                                            ClientMessage::PointerEvent { button_mask, x, y },
                                            id, &mut state, &inner, &mut input_translator, &config,
                                        )?;
                                        handle_client_message(other, id, &mut state, &inner, &mut input_translator, &config)?;
                                        continue 'messages;
                                    }
                                    None => break,
                                }
                            }
                            handle_client_message(
                                ClientMessage::PointerEvent { button_mask, x, y },
                                id, &mut state, &inner, &mut input_translator, &config,
                            )?;
                        }
                        other => handle_client_message(other, id, &mut state, &inner, &mut input_translator, &config)?,
                    }
                }
            }

            notice = updates_rx.recv() => {
                match notice {
                    Ok(notice) if notice.full_refresh => {
                        state.full_refresh_pending = true;
                        state.dirty.clear();
                        if notice.resized.is_some() {
                            state.pending_resize = true;
                        }
                    }
                    Ok(notice) => state.dirty.extend(notice.regions),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        state.full_refresh_pending = true;
                        state.dirty.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }

            cursor = cursor_rx.recv() => {
                match cursor {
                    Ok(image) => {
                        if state.last_cursor_sent.as_ref() != Some(&image) {
                            state.pending_cursor = Some(image);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }

            _ = throttle.tick() => {
                send_update(&mut transport, &mut state, &inner, &translation_cache, &config, profile).await?;
            }
        }
    }
}

async fn write_security_result(transport: &mut Transport, ok: bool, version: RfbVersion) -> Result<()> {
    let mut out = BytesMut::new();
    out.put_u32(if ok { SECURITY_RESULT_OK } else { SECURITY_RESULT_FAILED });
    if !ok && version.security_result_has_reason() {
        let reason = b"authentication failed";
        #[allow(clippy::cast_possible_truncation)]
        out.put_u32(reason.len() as u32);
        out.put_slice(reason);
    }
    transport.write_all(&out).await
}

/// Negotiates security type and, for VNC-Auth, runs the DES challenge and
/// checks the response.
///
/// `SecurityResult` is sent whenever VNC-Auth was used (every protocol
/// version requires it there), and additionally for `None` under 3.8 only
/// — 3.3 and 3.7 proceed straight to `ClientInit` after a `None` choice,
/// per RFC 6143 §7.1.2/§7.2.1.
async fn perform_security_handshake(
    transport: &mut Transport,
    buf: &mut BytesMut,
    version: RfbVersion,
    config: &Config,
    inner: &ServerInner,
) -> Result<()> {
    let security_type = if config.password.is_some() { SECURITY_TYPE_VNC_AUTH } else { SECURITY_TYPE_NONE };

    if version.offers_security_list() {
        let mut out = BytesMut::new();
        out.put_u8(1);
        out.put_u8(security_type);
        transport.write_all(&out).await?;

        fill(transport, buf, 1).await?;
        let chosen = buf.split_to(1)[0];
        if chosen != security_type {
            return Err(VncError::Protocol(format!("client selected unsupported security type {chosen}")));
        }
    } else {
        let mut out = BytesMut::new();
        out.put_u32(u32::from(security_type));
        transport.write_all(&out).await?;
    }

    let sends_result = security_type == SECURITY_TYPE_VNC_AUTH || version == RfbVersion::V3_8;

    if security_type == SECURITY_TYPE_VNC_AUTH {
        let password = config.password.clone().expect("VNC-Auth is only offered when a password is configured");
        let auth = VncAuth::new(&password);
        let challenge = VncAuth::generate_challenge();
        transport.write_all(&challenge).await?;

        fill(transport, buf, 16).await?;
        let response_bytes = buf.split_to(16);
        let mut response = [0u8; 16];
        response.copy_from_slice(&response_bytes);

        if let Err(e) = auth.verify_response(&challenge, &response) {
            inner.metrics.record_auth_failure();
            if sends_result {
                write_security_result(transport, false, version).await?;
            }
            return Err(e);
        }
    }

    if sends_result {
        write_security_result(transport, true, version).await?;
    }

    Ok(())
}

fn handle_client_message(
    msg: ClientMessage,
    id: usize,
    state: &mut ClientState,
    inner: &Arc<ServerInner>,
    input_translator: &mut InputTranslator,
    config: &Config,
) -> Result<()> {
    match msg {
        ClientMessage::SetPixelFormat(pf) => {
            if !pf.is_valid() {
                return Err(VncError::Protocol("client requested an invalid pixel format".to_string()));
            }
            state.pixel_format = pf;
            state.reset_on_format_change(config.zlib_compression_level);
        }
        ClientMessage::SetEncodings(encodings) => {
            state.encodings = encodings;
        }
        ClientMessage::FramebufferUpdateRequest { incremental, x, y, width, height } => {
            if !incremental {
                state.full_refresh_pending = true;
                state.dirty.clear();
            }
            state.pending_request = Some(PendingRequest { x, y, width, height, incremental });
        }
        ClientMessage::KeyEvent { down, key } => {
            inner.publish(ServerEvent::KeyEvent { client_id: id, key, pressed: down });
            if let Some(sink) = inner.input_sink.lock().expect("input sink lock poisoned").as_mut() {
                input_translator.handle_key_event(sink.as_mut(), down, key);
            }
        }
        ClientMessage::PointerEvent { button_mask, x, y } => {
            inner.publish(ServerEvent::PointerEvent { client_id: id, x, y, button_mask });
            if let Some(sink) = inner.input_sink.lock().expect("input sink lock poisoned").as_mut() {
                input_translator.handle_pointer_event(sink.as_mut(), button_mask, x, y);
            }
        }
        ClientMessage::ClientCutText(text) => {
            inner.publish(ServerEvent::ClipboardReceived { client_id: id, text });
        }
    }
    Ok(())
}

/// Content hint feeding [`EncoderManager::select`], derived fresh each
/// send from this cycle's network profile and damage shape rather than
/// tracked history — simple, and adequate since a hint only biases which
/// encoding wins, it never changes correctness.
fn derive_hint(profile: NetworkProfile, full_refresh: bool, opportunistic_copyrect: bool, region_count: usize) -> ContentHint {
    if matches!(profile, NetworkProfile::Localhost | NetworkProfile::Lan) {
        return ContentHint::Lan;
    }
    if opportunistic_copyrect {
        return ContentHint::Scrolling;
    }
    if full_refresh {
        return ContentHint::Dynamic;
    }
    match region_count {
        0 => ContentHint::Default,
        1..=2 => ContentHint::Static,
        _ => ContentHint::Dynamic,
    }
}

/// Picks the wire encoding for one send cycle.
///
/// Tight (7) sits outside every `§4.5` content-hint preference list — the
/// spec's lists only ever enumerate `{ZRLE, Hextile, RRE, CopyRect, Raw}`
/// — so without an override a client that advertises Tight could never
/// actually receive it despite the encoder being fully implemented. This
/// gives Tight absolute priority whenever the client supports it, and
/// otherwise defers to [`EncoderManager::select`] unchanged. CopyRect is
/// filtered out of that fallback because it's only ever selected by the
/// opportunistic whole-frame path below, never for a regular region.
fn select_encoding(client_encodings: &[i32], hint: ContentHint) -> i32 {
    if client_encodings.contains(&ENCODING_TIGHT) {
        return ENCODING_TIGHT;
    }
    let filtered: Vec<i32> = client_encodings.iter().copied().filter(|&e| e != ENCODING_COPYRECT).collect();
    EncoderManager::select(&filtered, hint)
}

fn extract_region(snapshot: &[u8], width: u16, region: &DirtyRegion) -> Vec<u8> {
    let stride = width as usize * 4;
    let mut out = Vec::with_capacity(region.width as usize * region.height as usize * 4);
    for row in 0..region.height {
        let offset = (region.y as usize + row as usize) * stride + region.x as usize * 4;
        let len = region.width as usize * 4;
        out.extend_from_slice(&snapshot[offset..offset + len]);
    }
    out
}

fn clip_regions_to_request(regions: Vec<DirtyRegion>, request: &PendingRequest, fb_w: u16, fb_h: u16) -> Vec<DirtyRegion> {
    let rx1 = request.x.min(fb_w);
    let ry1 = request.y.min(fb_h);
    let rx2 = request.x.saturating_add(request.width).min(fb_w);
    let ry2 = request.y.saturating_add(request.height).min(fb_h);

    regions
        .into_iter()
        .filter_map(|r| {
            let x1 = r.x.max(rx1);
            let y1 = r.y.max(ry1);
            let x2 = (r.x + r.width).min(rx2);
            let y2 = (r.y + r.height).min(ry2);
            (x2 > x1 && y2 > y1).then_some(DirtyRegion { x: x1, y: y1, width: x2 - x1, height: y2 - y1 })
        })
        .collect()
}

/// Builds the CopyRect rectangle for a detected whole-frame `shift`: the
/// destination covers the overlap between the previous and current frame,
/// and the 4-byte body names the source point the client copies from.
fn build_copyrect_rectangle(shift: ShiftMatch, width: u16, height: u16) -> (Rectangle, BytesMut) {
    let dx = i32::from(shift.dx);
    let dy = i32::from(shift.dy);

    let dst_x = dx.max(0) as u16;
    let dst_y = dy.max(0) as u16;
    let src_x = (-dx).max(0) as u16;
    let src_y = (-dy).max(0) as u16;
    let w = (i32::from(width) - dx.abs()).max(0) as u16;
    let h = (i32::from(height) - dy.abs()).max(0) as u16;

    let mut body = BytesMut::with_capacity(4);
    body.put_u16(src_x);
    body.put_u16(src_y);

    (Rectangle { x: dst_x, y: dst_y, width: w, height: h, encoding: ENCODING_COPYRECT }, body)
}

/// The strip(s) a whole-frame shift leaves uncovered, which still need to
/// be sent as ordinary encoded rectangles alongside the CopyRect.
fn exposed_regions(shift: ShiftMatch, width: u16, height: u16) -> Vec<DirtyRegion> {
    let dx = i32::from(shift.dx);
    let dy = i32::from(shift.dy);
    let mut regions = Vec::new();

    if dx > 0 {
        regions.push(DirtyRegion { x: 0, y: 0, width: dx as u16, height });
    } else if dx < 0 {
        let w = (-dx) as u16;
        regions.push(DirtyRegion { x: width - w, y: 0, width: w, height });
    }

    if dy > 0 {
        regions.push(DirtyRegion { x: 0, y: 0, width, height: dy as u16 });
    } else if dy < 0 {
        let h = (-dy) as u16;
        regions.push(DirtyRegion { x: 0, y: height - h, width, height: h });
    }

    regions
}

/// Builds the DesktopSize or ExtendedDesktopSize pseudo-rectangle announcing
/// a framebuffer resize, picking ExtendedDesktopSize when the client
/// advertised it (it carries the same information plus a screen layout,
/// per RFC 6143 §7.7.1/RFB extension) and otherwise falling back to the
/// plain DesktopSize pseudo-encoding.
///
/// Both carry no pixel data; the resize itself is fully described by the
/// rectangle header and, for ExtendedDesktopSize, the screens array.
fn build_desktop_size_rectangle(width: u16, height: u16, client_encodings: &[i32]) -> (Rectangle, BytesMut) {
    if client_encodings.contains(&ENCODING_EXTENDED_DESKTOP_SIZE) {
        let mut body = BytesMut::with_capacity(4 + 16);
        body.put_u8(1); // number-of-screens
        body.put_u8(0); // padding
        body.put_u16(0); // padding
        body.put_u32(0); // screen id
        body.put_u16(0); // x
        body.put_u16(0); // y
        body.put_u16(width);
        body.put_u16(height);
        body.put_u32(0); // flags
        (
            Rectangle { x: 0, y: 0, width, height, encoding: ENCODING_EXTENDED_DESKTOP_SIZE },
            body,
        )
    } else {
        (Rectangle { x: 0, y: 0, width, height, encoding: ENCODING_DESKTOP_SIZE }, BytesMut::new())
    }
}

/// Builds the Cursor pseudo-rectangle for a pushed cursor image: the
/// client's pixel-format-translated RGB data followed by a row-padded
/// 1-bit-per-pixel opacity bitmask, per RFC 6143 §7.7.2.
fn build_cursor_rectangle(
    image: &CursorImage,
    client_format: &PixelFormat,
    translation_cache: &TranslationCache,
) -> (Rectangle, BytesMut) {
    let pixels = translation_cache.translate(&image.rgba, &PixelFormat::rgba32(), client_format);

    let row_bytes = (image.width as usize + 7) / 8;
    let mut bitmask = vec![0u8; row_bytes * image.height as usize];
    for y in 0..image.height as usize {
        for x in 0..image.width as usize {
            let alpha = image.rgba[(y * image.width as usize + x) * 4 + 3];
            if alpha >= 128 {
                bitmask[y * row_bytes + x / 8] |= 0x80 >> (x % 8);
            }
        }
    }

    let mut body = BytesMut::with_capacity(pixels.len() + bitmask.len());
    body.extend_from_slice(&pixels);
    body.extend_from_slice(&bitmask);

    (
        Rectangle {
            x: image.hotspot_x,
            y: image.hotspot_y,
            width: image.width,
            height: image.height,
            encoding: ENCODING_CURSOR,
        },
        body,
    )
}

/// Encodes one already-translated region into its wire rectangle(s).
///
/// ZRLE and Tight carry persistent zlib state in `state`, so they're
/// handled directly here rather than through the stateless [`Encoding`]
/// trait. A ZRLE failure falls back to Raw for that rectangle instead of
/// failing the whole connection; Tight's encoder is infallible, and the
/// stateless path falls back to Raw whenever the chosen encoding didn't
/// actually beat Raw's size.
fn encode_region(
    region: DirtyRegion,
    translated: &[u8],
    bpp: usize,
    encoding_type: i32,
    config: &Config,
    state: &mut ClientState,
) -> Result<Vec<(Rectangle, BytesMut)>> {
    match encoding_type {
        ENCODING_TIGHT => {
            let subs = tight::encode_tight_persistent(
                translated,
                region.width,
                region.height,
                config.jpeg_default_quality,
                config.zlib_compression_level,
                &state.pixel_format,
                &mut state.tight_streams,
            );
            Ok(subs
                .into_iter()
                .map(|(sx, sy, sw, sh, body)| {
                    (Rectangle { x: region.x + sx, y: region.y + sy, width: sw, height: sh, encoding: ENCODING_TIGHT }, body)
                })
                .collect())
        }
        ENCODING_ZRLE => {
            match zrle::encode_zrle_persistent(translated, region.width, region.height, &state.pixel_format, &mut state.zrle_compressor) {
                Ok(body) => Ok(vec![(
                    Rectangle { x: region.x, y: region.y, width: region.width, height: region.height, encoding: ENCODING_ZRLE },
                    BytesMut::from(&body[..]),
                )]),
                Err(e) => {
                    warn!("ZRLE encode failed, falling back to Raw for this rectangle: {e}");
                    let raw = encoding::get_encoder(ENCODING_RAW).expect("raw encoder always registered");
                    let body = raw.encode(translated, region.width, region.height, bpp);
                    Ok(vec![(
                        Rectangle { x: region.x, y: region.y, width: region.width, height: region.height, encoding: ENCODING_RAW },
                        body,
                    )])
                }
            }
        }
        other => {
            let encoder = encoding::get_encoder(other).unwrap_or_else(|| encoding::get_encoder(ENCODING_RAW).expect("raw encoder always registered"));
            let body = encoder.encode(translated, region.width, region.height, bpp);
            let raw_len = region.width as usize * region.height as usize * bpp;

            let (final_encoding, final_body) = if other != ENCODING_RAW && body.len() >= raw_len {
                let raw = encoding::get_encoder(ENCODING_RAW).expect("raw encoder always registered");
                (ENCODING_RAW, raw.encode(translated, region.width, region.height, bpp))
            } else {
                (other, body)
            };

            Ok(vec![(
                Rectangle { x: region.x, y: region.y, width: region.width, height: region.height, encoding: final_encoding },
                final_body,
            )])
        }
    }
}

/// Answers the client's outstanding `FramebufferUpdateRequest`, if any,
/// with whatever's changed since the last send. A no-op (request stays
/// outstanding) when nothing within the requested area has changed yet.
async fn send_update(
    transport: &mut Transport,
    state: &mut ClientState,
    inner: &ServerInner,
    translation_cache: &TranslationCache,
    config: &Config,
    profile: NetworkProfile,
) -> Result<()> {
    let Some(request) = state.pending_request.take() else { return Ok(()) };

    let (width, height, snapshot) = {
        let fb = inner.framebuffer.read().expect("framebuffer lock poisoned");
        (fb.width(), fb.height(), fb.pixels().to_vec())
    };

    let mut rectangles: Vec<(Rectangle, BytesMut)> = Vec::new();
    let mut regions;
    let mut opportunistic_copyrect = false;

    if state.pending_cursor.is_some() && state.encodings.contains(&ENCODING_CURSOR) {
        let image = state.pending_cursor.take().expect("checked is_some above");
        rectangles.push(build_cursor_rectangle(&image, &state.pixel_format, translation_cache));
        state.last_cursor_sent = Some(image);
    }

    if state.pending_resize
        && (state.encodings.contains(&ENCODING_DESKTOP_SIZE) || state.encodings.contains(&ENCODING_EXTENDED_DESKTOP_SIZE))
    {
        rectangles.push(build_desktop_size_rectangle(width, height, &state.encodings));
        state.last_desktop_size_sent = (width, height);
        state.pending_resize = false;
    }

    if state.full_refresh_pending {
        let shift = state
            .last_full_frame
            .as_ref()
            .filter(|prev| prev.len() == snapshot.len() && state.encodings.contains(&ENCODING_COPYRECT))
            .and_then(|prev| copyrect::detect_shift(prev, &snapshot, width, height, 4));

        if let Some(shift) = shift {
            let (copy_rect, copy_body) = build_copyrect_rectangle(shift, width, height);
            rectangles.push((copy_rect, copy_body));
            regions = exposed_regions(shift, width, height);
            opportunistic_copyrect = true;
        } else {
            regions = vec![DirtyRegion { x: 0, y: 0, width, height }];
        }
    } else {
        regions = std::mem::take(&mut state.dirty);
    }

    regions = clip_regions_to_request(regions, &request, width, height);

    if regions.is_empty() && rectangles.is_empty() {
        state.pending_request = Some(request);
        return Ok(());
    }

    let full_refresh = state.full_refresh_pending;
    state.full_refresh_pending = false;
    state.last_full_frame = Some(snapshot.clone());

    let hint = derive_hint(profile, full_refresh, opportunistic_copyrect, regions.len());
    let encoding_type = select_encoding(&state.encodings, hint);
    let bpp = state.pixel_format.bytes_per_pixel();

    for region in regions {
        let pixels = extract_region(&snapshot, width, &region);
        let translated = translation_cache.translate(&pixels, &PixelFormat::rgba32(), &state.pixel_format);
        rectangles.extend(encode_region(region, &translated, bpp, encoding_type, config, state)?);
    }

    let mut out = BytesMut::with_capacity(4 + rectangles.iter().map(|(_, body)| body.len() + 12).sum::<usize>());
    out.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
    out.put_u8(0);
    #[allow(clippy::cast_possible_truncation)]
    out.put_u16(rectangles.len() as u16);
    for (rect, body) in &rectangles {
        rect.write_header(&mut out);
        out.extend_from_slice(body);
    }

    inner.metrics.add_bytes_sent(out.len() as u64);
    transport.write_all(&out).await?;
    #[allow(clippy::cast_possible_truncation)]
    inner.metrics.record_frame_sent(rectangles.len() as u64);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_loopback_as_localhost() {
        let peer: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        assert_eq!(classify_peer(peer), NetworkProfile::Localhost);
    }

    #[test]
    fn classifies_private_v4_as_lan() {
        let peer: SocketAddr = "192.168.1.5:5900".parse().unwrap();
        assert_eq!(classify_peer(peer), NetworkProfile::Lan);
    }

    #[test]
    fn classifies_public_v4_as_wan() {
        let peer: SocketAddr = "8.8.8.8:5900".parse().unwrap();
        assert_eq!(classify_peer(peer), NetworkProfile::Wan);
    }

    #[test]
    fn lan_and_localhost_profiles_force_lan_hint() {
        assert_eq!(derive_hint(NetworkProfile::Localhost, true, false, 5), ContentHint::Lan);
        assert_eq!(derive_hint(NetworkProfile::Lan, false, false, 0), ContentHint::Lan);
    }

    #[test]
    fn wan_opportunistic_copyrect_prefers_scrolling() {
        assert_eq!(derive_hint(NetworkProfile::Wan, true, true, 0), ContentHint::Scrolling);
    }

    #[test]
    fn wan_full_refresh_without_copyrect_prefers_dynamic() {
        assert_eq!(derive_hint(NetworkProfile::Wan, true, false, 0), ContentHint::Dynamic);
    }

    #[test]
    fn wan_small_region_count_prefers_static() {
        assert_eq!(derive_hint(NetworkProfile::Wan, false, false, 1), ContentHint::Static);
    }

    #[test]
    fn select_encoding_prefers_tight_when_advertised() {
        let client = vec![ENCODING_RAW, ENCODING_ZRLE, ENCODING_TIGHT];
        assert_eq!(select_encoding(&client, ContentHint::Default), ENCODING_TIGHT);
    }

    #[test]
    fn select_encoding_falls_back_to_encoder_manager_without_tight() {
        let client = vec![ENCODING_RAW, ENCODING_ZRLE];
        assert_eq!(select_encoding(&client, ContentHint::Static), ENCODING_ZRLE);
    }

    #[test]
    fn select_encoding_never_returns_copyrect_for_regular_regions() {
        let client = vec![ENCODING_COPYRECT, ENCODING_RAW];
        assert_eq!(select_encoding(&client, ContentHint::Scrolling), ENCODING_RAW);
    }

    #[test]
    fn clip_regions_drops_empty_intersection() {
        let request = PendingRequest { x: 0, y: 0, width: 10, height: 10, incremental: true };
        let regions = vec![DirtyRegion { x: 20, y: 20, width: 5, height: 5 }];
        assert!(clip_regions_to_request(regions, &request, 100, 100).is_empty());
    }

    #[test]
    fn clip_regions_intersects_partial_overlap() {
        let request = PendingRequest { x: 0, y: 0, width: 10, height: 10, incremental: true };
        let regions = vec![DirtyRegion { x: 5, y: 5, width: 10, height: 10 }];
        let clipped = clip_regions_to_request(regions, &request, 100, 100);
        assert_eq!(clipped, vec![DirtyRegion { x: 5, y: 5, width: 5, height: 5 }]);
    }

    #[test]
    fn copyrect_rectangle_covers_the_overlap_region() {
        let shift = ShiftMatch { dx: 5, dy: 0 };
        let (rect, body) = build_copyrect_rectangle(shift, 100, 50);
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (5, 0, 95, 50));
        assert_eq!(body.len(), 4);
    }

    #[test]
    fn exposed_regions_cover_the_strip_the_copy_left_behind() {
        let shift = ShiftMatch { dx: 5, dy: 0 };
        let regions = exposed_regions(shift, 100, 50);
        assert_eq!(regions, vec![DirtyRegion { x: 0, y: 0, width: 5, height: 50 }]);
    }

    #[test]
    fn extract_region_reads_the_right_bytes() {
        let mut snapshot = vec![0u8; 4 * 4 * 4]; // 4x4 RGBA32
        snapshot[(1 * 4 + 1) * 4] = 42; // red byte of pixel (1, 1)
        let region = DirtyRegion { x: 1, y: 1, width: 2, height: 2 };
        let extracted = extract_region(&snapshot, 4, &region);
        assert_eq!(extracted[0], 42);
        assert_eq!(extracted.len(), 2 * 2 * 4);
    }

    #[test]
    fn desktop_size_rectangle_is_empty_without_extended_support() {
        let (rect, body) = build_desktop_size_rectangle(800, 600, &[ENCODING_DESKTOP_SIZE]);
        assert_eq!((rect.x, rect.y, rect.width, rect.height, rect.encoding), (0, 0, 800, 600, ENCODING_DESKTOP_SIZE));
        assert!(body.is_empty());
    }

    #[test]
    fn desktop_size_rectangle_carries_a_screen_descriptor_when_extended_is_advertised() {
        let (rect, body) = build_desktop_size_rectangle(800, 600, &[ENCODING_EXTENDED_DESKTOP_SIZE]);
        assert_eq!(rect.encoding, ENCODING_EXTENDED_DESKTOP_SIZE);
        assert_eq!(body.len(), 4 + 16);
        assert_eq!(body[0], 1, "number-of-screens");
        assert_eq!(u16::from_be_bytes([body[4 + 8], body[4 + 9]]), 800);
        assert_eq!(u16::from_be_bytes([body[4 + 10], body[4 + 11]]), 600);
    }

    #[test]
    fn cursor_rectangle_carries_translated_pixels_and_an_opaque_bitmask() {
        let translation_cache = TranslationCache::new();
        let image = CursorImage {
            rgba: vec![0xFFu8; 2 * 2 * 4], // 2x2, fully opaque
            width: 2,
            height: 2,
            hotspot_x: 1,
            hotspot_y: 1,
        };
        let (rect, body) = build_cursor_rectangle(&image, &PixelFormat::bgr0(), &translation_cache);
        assert_eq!((rect.x, rect.y, rect.width, rect.height, rect.encoding), (1, 1, 2, 2, ENCODING_CURSOR));
        // 2x2 pixels @ 4 bytes/pixel + 2 rows of 1-byte bitmask (row_bytes = (2+7)/8 = 1)
        assert_eq!(body.len(), 2 * 2 * 4 + 2);
        let bitmask = &body[2 * 2 * 4..];
        assert_eq!(bitmask, &[0b1100_0000, 0b1100_0000]);
    }

    #[test]
    fn cursor_rectangle_marks_transparent_pixels_unset_in_the_bitmask() {
        let translation_cache = TranslationCache::new();
        let mut rgba = vec![0xFFu8; 2 * 2 * 4];
        rgba[3] = 0; // top-left pixel fully transparent
        let image = CursorImage { rgba, width: 2, height: 2, hotspot_x: 0, hotspot_y: 0 };
        let (_, body) = build_cursor_rectangle(&image, &PixelFormat::bgr0(), &translation_cache);
        let bitmask = &body[2 * 2 * 4..];
        assert_eq!(bitmask[0], 0b0100_0000);
    }

    #[test]
    fn client_state_starts_with_a_full_refresh_pending() {
        let state = ClientState::new(6, 640, 480);
        assert!(state.full_refresh_pending);
        assert!(state.last_full_frame.is_none());
    }

    #[test]
    fn reset_on_format_change_forces_a_full_refresh() {
        let mut state = ClientState::new(6, 640, 480);
        state.full_refresh_pending = false;
        state.dirty.push(DirtyRegion { x: 0, y: 0, width: 1, height: 1 });
        state.last_full_frame = Some(vec![0u8; 16]);

        state.reset_on_format_change(6);

        assert!(state.full_refresh_pending);
        assert!(state.dirty.is_empty());
        assert!(state.last_full_frame.is_none());
    }
}
