/// Associates readiness events with their I/O source.
///
/// `Token` is an opaque value passed to the selector when registering a
/// file descriptor. When the selector reports readiness it hands the
/// token back, letting the reactor map the event to the source table
/// entry that produced it. Tokens are slab keys; one value is reserved
/// for the reactor's own wakeup object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}

#[cfg(test)]
mod tests {
    use super::Token;

    #[test]
    fn token_roundtrip() {
        let token = Token(123);
        let val: usize = token.into();
        assert_eq!(val, 123);
        assert_eq!(Token(val), token);
    }
}
