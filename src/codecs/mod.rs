//! Cache Codec Implementations
//!
//! Built-in implementations of the [`CacheCodec`](crate::traits::CacheCodec)
//! trait used by the persistent tiers to encode entry envelopes.
//!
//! Only self-describing formats are offered: envelopes carry an arbitrary
//! `serde_json::Value`, which compact schema-driven formats cannot decode.

mod json;
pub use json::JsonCodec;

#[cfg(feature = "msgpack")]
mod msgpack;
#[cfg(feature = "msgpack")]
#[cfg_attr(docsrs, doc(cfg(feature = "msgpack")))]
pub use msgpack::MsgPackCodec;
