//! The out-of-band server-info query surface: a provider on the server side
//!  hands out an opaque pre-serialized blob, a [`WireSerialize`] implementation
//!  on the caller side gives the blob its meaning. The query is stateless by
//!  design - answering it never creates or touches a peer record.

use async_trait::async_trait;
use bytes::{Buf, BufMut};
#[cfg(test)]
use mockall::automock;

/// The crate's serialization convention for application-visible wire values:
///  write into any [`BufMut`], read fallibly from any [`Buf`].
pub trait WireSerialize: Sized {
    fn ser(&self, buf: &mut impl BufMut);
    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self>;
}

/// Serializes a value into a fresh byte vector - the usual way to implement
///  a [`ServerInfoProvider`] on top of a [`WireSerialize`] type.
pub fn to_wire_bytes<T: WireSerialize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.ser(&mut buf);
    buf
}

/// Supplies the blob returned for a server-info request. Queried per request,
///  so the answer may change over the server's lifetime (current map, player
///  count, ...).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerInfoProvider: Send + Sync + 'static {
    async fn server_info(&self) -> Vec<u8>;
}

/// Provider for servers that have nothing to announce.
pub struct NoServerInfo;

#[async_trait]
impl ServerInfoProvider for NoServerInfo {
    async fn server_info(&self) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Info {
        player_count: u32,
        max_players: u32,
    }

    impl WireSerialize for Info {
        fn ser(&self, buf: &mut impl BufMut) {
            buf.put_u32_le(self.player_count);
            buf.put_u32_le(self.max_players);
        }

        fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
            Ok(Info {
                player_count: buf.try_get_u32_le()?,
                max_players: buf.try_get_u32_le()?,
            })
        }
    }

    #[test]
    fn test_wire_round_trip() {
        let info = Info { player_count: 7, max_players: 64 };
        let bytes = to_wire_bytes(&info);

        let mut read: &[u8] = &bytes;
        assert_eq!(Info::deser(&mut read).unwrap(), info);
        assert!(read.is_empty());
    }

    #[test]
    fn test_deser_rejects_truncated_input() {
        let mut read: &[u8] = &[1, 0, 0];
        assert!(Info::deser(&mut read).is_err());
    }
}
