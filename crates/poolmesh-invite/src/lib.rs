//! Invite token codec: `base64url(gzip(signed-JSON(Token)))` sharing a
//! pool's backend URLs and sender identity with a chosen recipient set
//! (spec.md §4.9).

pub mod codec;
pub mod token;

pub use codec::{decode, encode, Invite};
pub use token::Token;
