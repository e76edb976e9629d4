use std::sync::OnceLock;

use secp256k1::{All, Secp256k1};

static SECP256K1: OnceLock<Secp256k1<All>> = OnceLock::new();

/// Process-wide signing/verification context.
pub fn secp256k1_ctx() -> &'static Secp256k1<All> {
    SECP256K1.get_or_init(Secp256k1::new)
}
