use std::time::Duration;

use anyhow::bail;

/// Tunables for servers, clients and the connections they own. Passed programmatically at
///  construction time - there is no config file and no CLI surface.
#[derive(Clone, Copy, Debug)]
pub struct NetConfig {
    /// Upper bound for the body length a peer may announce in a frame header. A header
    ///  exceeding this closes the connection: an unchecked length would let a broken or
    ///  malicious peer make the receiver allocate arbitrary amounts of memory.
    pub max_message_size: u32,

    /// How long the server waits for a client's handshake response before giving up and
    ///  closing the socket.
    pub handshake_timeout: Duration,

    /// First identifier handed out to an admitted connection. Subsequent connections get
    ///  sequential ids. The offset keeps connection ids recognizable next to other id
    ///  spaces an application may use.
    pub first_connection_id: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            max_message_size: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
            first_connection_id: 10_000,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size == 0 {
            bail!("max message size must be nonzero");
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be nonzero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(NetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_max_message_size() {
        let config = NetConfig {
            max_message_size: 0,
            ..NetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_handshake_timeout() {
        let config = NetConfig {
            handshake_timeout: Duration::ZERO,
            ..NetConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
