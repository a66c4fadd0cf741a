//! Descriptor for a command a transaction is asked to run.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use twopence_core::environment::Environment;
use twopence_core::error::TwopenceError;

use crate::codec::{self, PacketType};

/// A command to run on the target, and the context it runs in.
#[derive(Debug, Clone)]
pub struct Command {
    /// The shell command line, passed to the target's command interpreter
    /// verbatim.
    pub command_line: String,
    /// Extra environment variables layered over the target's defaults.
    pub environment: Environment,
    /// User to run the command as; `None` defers to the target's default.
    pub user: Option<String>,
    /// Per-command timeout; `None` defers to the target's default.
    pub timeout: Option<std::time::Duration>,
    /// Whether stdin should be treated as a live chat channel (bidirectional,
    /// interactive) rather than a one-shot blob supplied up front.
    pub chat: bool,
}

impl Command {
    #[must_use]
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            environment: Environment::new(),
            user: None,
            timeout: None,
            chat: false,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn chatty(mut self) -> Self {
        self.chat = true;
        self
    }

    const FLAG_CHAT: u8 = 0x01;
    const FLAG_USER: u8 = 0x02;
    const FLAG_TIMEOUT: u8 = 0x04;

    /// Build a `COMMAND` frame carrying this descriptor's fields ahead of
    /// the command line itself: a flags byte, an optional user name, an
    /// optional per-command timeout in milliseconds, the environment
    /// overrides, then the command line filling out the rest of the
    /// payload.
    #[must_use]
    pub fn encode(&self, xid: u16) -> Bytes {
        let mut payload = BytesMut::new();
        let mut flags = 0u8;
        if self.chat {
            flags |= Self::FLAG_CHAT;
        }
        if self.user.is_some() {
            flags |= Self::FLAG_USER;
        }
        if self.timeout.is_some() {
            flags |= Self::FLAG_TIMEOUT;
        }
        payload.put_u8(flags);
        if let Some(user) = &self.user {
            put_string(&mut payload, user);
        }
        if let Some(timeout) = self.timeout {
            payload.put_u32(timeout.as_millis() as u32);
        }
        payload.put_u16(self.environment.len() as u16);
        for (key, value) in self.environment.iter() {
            put_string(&mut payload, key);
            put_string(&mut payload, value);
        }
        payload.extend_from_slice(self.command_line.as_bytes());
        codec::build_frame(PacketType::Command, xid, &payload)
    }

    /// Parse a `COMMAND` frame's payload back into a descriptor.
    pub fn decode(mut payload: Bytes) -> Result<Self, TwopenceError> {
        let flags = read_u8(&mut payload)?;
        let user = if flags & Self::FLAG_USER != 0 {
            Some(get_string(&mut payload)?)
        } else {
            None
        };
        let timeout = if flags & Self::FLAG_TIMEOUT != 0 {
            if payload.len() < 4 {
                return Err(TwopenceError::protocol("truncated command timeout"));
            }
            Some(std::time::Duration::from_millis(u64::from(payload.get_u32())))
        } else {
            None
        };
        if payload.len() < 2 {
            return Err(TwopenceError::protocol("truncated command environment count"));
        }
        let var_count = payload.get_u16();
        let mut environment = Environment::new();
        for _ in 0..var_count {
            let key = get_string(&mut payload)?;
            let value = get_string(&mut payload)?;
            environment.set(key, value);
        }
        let command_line = String::from_utf8(payload.to_vec())
            .map_err(|_| TwopenceError::protocol("command line is not valid UTF-8"))?;
        Ok(Self {
            command_line,
            environment,
            user,
            timeout,
            chat: flags & Self::FLAG_CHAT != 0,
        })
    }
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

fn read_u8(payload: &mut Bytes) -> Result<u8, TwopenceError> {
    if payload.is_empty() {
        return Err(TwopenceError::protocol("truncated command flags"));
    }
    Ok(payload.get_u8())
}

fn get_string(payload: &mut Bytes) -> Result<String, TwopenceError> {
    if payload.len() < 2 {
        return Err(TwopenceError::protocol("truncated string length"));
    }
    let len = payload.get_u16() as usize;
    if payload.len() < len {
        return Err(TwopenceError::protocol("truncated string bytes"));
    }
    let bytes = payload.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| TwopenceError::protocol("string is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let cmd = Command::new("echo hi")
            .with_user("test")
            .with_timeout(std::time::Duration::from_secs(5))
            .chatty();
        assert_eq!(cmd.command_line, "echo hi");
        assert_eq!(cmd.user.as_deref(), Some("test"));
        assert_eq!(cmd.timeout, Some(std::time::Duration::from_secs(5)));
        assert!(cmd.chat);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut env = Environment::new();
        env.set("FOO", "bar");
        let cmd = Command::new("echo hi there")
            .with_user("test")
            .with_timeout(std::time::Duration::from_millis(2500))
            .with_environment(env)
            .chatty();

        let frame_bytes = cmd.encode(3);
        let mut buf = twopence_core::buffer::ByteBuffer::new(256);
        buf.append(&frame_bytes);
        let mut decoder = codec::FrameDecoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.xid, 3);
        assert!(matches!(frame.packet_type, PacketType::Command));

        let decoded = Command::decode(frame.payload).unwrap();
        assert_eq!(decoded.command_line, "echo hi there");
        assert_eq!(decoded.user.as_deref(), Some("test"));
        assert_eq!(decoded.timeout, Some(std::time::Duration::from_millis(2500)));
        assert!(decoded.chat);
        assert_eq!(decoded.environment.get("FOO"), Some("bar"));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let err = Command::decode(Bytes::new());
        assert!(err.is_err());
    }
}
