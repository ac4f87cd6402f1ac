use std::time::Duration;

/// The default initial channel window, matching OpenSSH's own default.
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// The default maximum packet size for a single `CHANNEL_DATA` message.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Upper bound on a single SFTP `WRITE` payload.
pub const SFTP_MAX_WRITE_LEN: usize = 32_000;

/// Timeout applied to subsystem-request, channel-open, and SFTP
/// `INIT`/`VERSION`.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Opaque, core-ignored algorithm/identity policy handed straight through to
/// the [`Transport`](crate::transport::Transport) at connect time.
///
/// The core never inspects this value; it exists so that callers have
/// somewhere to put KEX/cipher/host-key policy without reaching for a
/// process-global registry.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmPolicy {
    /// Implementation-defined payload interpreted only by the transport.
    pub opaque: Vec<u8>,
}

/// Tunables for a [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) window_size: u32,
    pub(crate) max_packet_size: u32,
    pub(crate) channel_open_timeout: Duration,
    pub(crate) subsystem_timeout: Duration,
    pub(crate) sftp_handshake_timeout: Duration,
    pub(crate) algorithm_policy: AlgorithmPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            channel_open_timeout: DEFAULT_REQUEST_TIMEOUT,
            subsystem_timeout: DEFAULT_REQUEST_TIMEOUT,
            sftp_handshake_timeout: DEFAULT_REQUEST_TIMEOUT,
            algorithm_policy: AlgorithmPolicy::default(),
        }
    }
}

/// Builds a [`SessionConfig`].
///
/// Mirrors the `&mut self -> &mut Self` chaining style used throughout this
/// crate (see [`crate::exec::Command`], [`crate::sftp::OpenOptions`]).
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial per-channel window size.
    pub fn window_size(&mut self, window_size: u32) -> &mut Self {
        self.config.window_size = window_size;
        self
    }

    /// Set the maximum size of a single `CHANNEL_DATA` packet.
    pub fn max_packet_size(&mut self, max_packet_size: u32) -> &mut Self {
        self.config.max_packet_size = max_packet_size;
        self
    }

    /// Set the timeout for `openChannel`.
    pub fn channel_open_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.channel_open_timeout = timeout;
        self
    }

    /// Set the timeout for subsystem channel-requests (e.g. `sftp`).
    pub fn subsystem_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.subsystem_timeout = timeout;
        self
    }

    /// Set the timeout for the SFTP `INIT`/`VERSION` handshake.
    pub fn sftp_handshake_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.sftp_handshake_timeout = timeout;
        self
    }

    /// Set the algorithm/identity policy passed through to the transport.
    pub fn algorithm_policy(&mut self, policy: AlgorithmPolicy) -> &mut Self {
        self.config.algorithm_policy = policy;
        self
    }

    /// Finish building, yielding the immutable config.
    pub fn build(&self) -> SessionConfig {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = SessionBuilder::new()
            .window_size(1024)
            .max_packet_size(512)
            .channel_open_timeout(Duration::from_secs(1))
            .build();

        assert_eq!(config.window_size, 1024);
        assert_eq!(config.max_packet_size, 512);
        assert_eq!(config.channel_open_timeout, Duration::from_secs(1));
    }

    #[test]
    fn defaults_use_standard_timeouts() {
        let config = SessionConfig::default();
        assert_eq!(config.subsystem_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.sftp_handshake_timeout, DEFAULT_REQUEST_TIMEOUT);
    }
}
