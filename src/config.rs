//! Server and session configuration.
//!
//! There is no file, environment, or CLI parsing here by design: callers
//! construct a [`Config`] programmatically, the same way the teacher's
//! `VncServer::new(...).set_password(...)` builder works.

/// Tunables for a [`crate::VncServer`] instance and the sessions it spawns.
///
/// All fields have defaults matching common RFB server behavior; use
/// [`Config::builder`] to override only what you need.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the listening socket to.
    pub listen_host: String,
    /// TCP port to bind the listening socket to.
    pub listen_port: u16,
    /// VNC-Auth password. `None` offers the `None` security type only.
    pub password: Option<String>,
    /// Maximum number of concurrently connected clients.
    pub max_connections: usize,
    /// Upper bound on update send rate, in frames per second.
    pub max_fps: u32,
    /// Tile edge length used by the change detector, in pixels.
    pub tile_size: u16,
    /// Seconds of inactivity before a session is dropped.
    pub idle_timeout_s: u64,
    /// Maximum number of encodings accepted in a single `SetEncodings`.
    pub max_set_encodings: usize,
    /// Maximum accepted `ClientCutText` payload, in bytes.
    pub max_client_cut_text_bytes: usize,
    /// Whether the WebSocket adapter is enabled alongside raw TCP.
    pub websocket_enabled: bool,
    /// Maximum accepted WebSocket frame payload, in bytes.
    pub websocket_max_payload_bytes: usize,
    /// Zlib compression level (1-9) used by Tight and ZRLE streams.
    pub zlib_compression_level: u8,
    /// Default JPEG quality (0-100) for Tight's Jpeg class.
    pub jpeg_default_quality: u8,
    /// Optional server-side framebuffer downscale factor (0.0, 1.0].
    pub scale_factor: f32,
    /// Desktop name advertised in `ServerInit`.
    pub desktop_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: crate::DEFAULT_PORT,
            password: None,
            max_connections: 16,
            max_fps: 30,
            tile_size: 64,
            idle_timeout_s: 300,
            max_set_encodings: 1024,
            max_client_cut_text_bytes: 16 * 1024 * 1024,
            websocket_enabled: false,
            websocket_max_payload_bytes: 8 * 1024 * 1024,
            zlib_compression_level: 6,
            jpeg_default_quality: 80,
            scale_factor: 1.0,
            desktop_name: "rustvncserver".to_string(),
        }
    }
}

impl Config {
    /// Starts a [`ConfigBuilder`] seeded with defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder { config: Config::default() }
    }
}

/// Fluent builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets the listen address.
    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.config.listen_host = host.into();
        self
    }

    /// Sets the listen port.
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.listen_port = port;
        self
    }

    /// Sets the VNC-Auth password; pass `None` to allow unauthenticated clients.
    pub fn password(mut self, password: Option<impl Into<String>>) -> Self {
        self.config.password = password.map(Into::into);
        self
    }

    /// Sets the maximum number of concurrent connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Sets the maximum update send rate.
    pub fn max_fps(mut self, fps: u32) -> Self {
        self.config.max_fps = fps;
        self
    }

    /// Sets the change-detector tile edge length.
    pub fn tile_size(mut self, size: u16) -> Self {
        self.config.tile_size = size;
        self
    }

    /// Sets the idle session timeout, in seconds.
    pub fn idle_timeout_s(mut self, secs: u64) -> Self {
        self.config.idle_timeout_s = secs;
        self
    }

    /// Sets the maximum accepted encoding count per `SetEncodings`.
    pub fn max_set_encodings(mut self, max: usize) -> Self {
        self.config.max_set_encodings = max;
        self
    }

    /// Sets the maximum accepted `ClientCutText` size, in bytes.
    pub fn max_client_cut_text_bytes(mut self, max: usize) -> Self {
        self.config.max_client_cut_text_bytes = max;
        self
    }

    /// Enables or disables the WebSocket adapter.
    pub fn websocket_enabled(mut self, enabled: bool) -> Self {
        self.config.websocket_enabled = enabled;
        self
    }

    /// Sets the maximum accepted WebSocket payload, in bytes.
    pub fn websocket_max_payload_bytes(mut self, max: usize) -> Self {
        self.config.websocket_max_payload_bytes = max;
        self
    }

    /// Sets the zlib compression level (clamped to 1-9).
    pub fn zlib_compression_level(mut self, level: u8) -> Self {
        self.config.zlib_compression_level = level.clamp(1, 9);
        self
    }

    /// Sets the default JPEG quality (clamped to 0-100).
    pub fn jpeg_default_quality(mut self, quality: u8) -> Self {
        self.config.jpeg_default_quality = quality.min(100);
        self
    }

    /// Sets the server-side framebuffer downscale factor.
    pub fn scale_factor(mut self, factor: f32) -> Self {
        self.config.scale_factor = factor.clamp(0.01, 1.0);
        self
    }

    /// Sets the desktop name advertised in `ServerInit`.
    pub fn desktop_name(mut self, name: impl Into<String>) -> Self {
        self.config.desktop_name = name.into();
        self
    }

    /// Finalizes the builder into a [`Config`].
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.tile_size, 64);
        assert_eq!(config.max_set_encodings, 1024);
        assert_eq!(config.max_client_cut_text_bytes, 16 * 1024 * 1024);
        assert_eq!(config.websocket_max_payload_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn builder_overrides_only_requested_fields() {
        let config = Config::builder()
            .listen_port(5901)
            .password(Some("secret"))
            .max_connections(4)
            .build();
        assert_eq!(config.listen_port, 5901);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.tile_size, 64); // untouched default
    }

    #[test]
    fn zlib_level_is_clamped() {
        let config = Config::builder().zlib_compression_level(20).build();
        assert_eq!(config.zlib_compression_level, 9);
    }
}
