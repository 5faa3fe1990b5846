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


//! # rustvncserver
//!
//! A pure Rust implementation of the core of a VNC (Virtual Network
//! Computing) server.
//!
//! This crate implements the RFB (Remote Framebuffer) protocol (RFC 6143):
//! version/security handshake, pixel-format and encoding negotiation,
//! change detection, and the Raw/CopyRect/RRE/Hextile/ZRLE/Tight encoder
//! family (with optional JPEG via Tight). Screen capture and input
//! injection are external collaborators — this crate asks an embedder
//! for frames and hands it translated input events, it never talks to a
//! display or input device directly.
//!
//! ## Features
//!
//! - **Six encodings plus JPEG-via-Tight**: Raw, CopyRect, RRE, Hextile,
//!   ZRLE, Tight (Fill/Palette/Gradient/Basic-zlib, with persistent
//!   cross-rectangle zlib streams)
//! - **All pixel formats**: 8/16/24/32-bit color depths, LUT-cached
//!   conversion from the server's native format
//! - **Async I/O**: built on Tokio, one cooperative task per connection
//! - **Optional WebSocket transport**: RFC 6455 framing for noVNC-style
//!   browser clients
//! - **Optional TurboJPEG**: JPEG compression for Tight's Jpeg class via
//!   a feature-gated FFI binding
//!
//! ## Quick Start
//!
//! ```no_run
//! use rustvncserver::{VncServer, ServerEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = VncServer::new(1920, 1080);
//!     server.set_password(Some("secret".to_string()));
//!
//!     let server_handle = tokio::spawn(async move { server.listen(5900).await });
//!
//!     // server.update_framebuffer(&pixels, 0, 0, 1920, 1080);
//!
//!     server_handle.await??;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Your Application              │
//! │                                         │
//! │  • Provide framebuffer data             │
//! │  • Receive input events                 │
//! │  • Control server lifecycle             │
//! └──────────────────┬──────────────────────┘
//!                    │
//!                    ▼
//! ┌─────────────────────────────────────────┐
//! │           VncServer (Public)            │
//! │                                         │
//! │  • TCP/WebSocket listener               │
//! │  • Connection pool (accept semaphore)   │
//! │  • Event distribution                   │
//! └──────────────────┬──────────────────────┘
//!                    │
//!        ┌───────────┼───────────┐
//!        ▼           ▼           ▼
//!   ┌────────┐ ┌────────┐ ┌────────┐
//!   │Client 1│ │Client 2│ │Client N│
//!   └────────┘ └────────┘ └────────┘
//!        │           │           │
//!        └───────────┴───────────┘
//!                    │
//!                    ▼
//! ┌─────────────────────────────────────────┐
//! │      Framebuffer (Thread-safe)          │
//! │                                         │
//! │  • RGBA32 pixel storage                 │
//! │  • Tile-grid change detection           │
//! │  • CopyRect shift detection             │
//! └─────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod input;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod websocket;

// Internal modules
mod auth;
mod client;
mod translate;
pub mod encoding;
pub mod jpeg;

// Re-exports
pub use config::{Config, ConfigBuilder};
pub use encoding::Encoding;
pub use error::{Result, VncError};
pub use events::{ServerEvent, SessionRecorder};
pub use framebuffer::Framebuffer;
pub use input::{InputSink, Key, MouseButton, ScrollDirection};
pub use metrics::{Metrics, MetricsSnapshot};
pub use protocol::{PixelFormat, PROTOCOL_VERSION};
pub use server::VncServer;

#[cfg(feature = "turbojpeg")]
pub use jpeg::TurboJpegEncoder;

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
