/// Associates readiness events with the descriptor that produced them.
///
/// `Token` is a wrapper around `usize`. The event loop uses the raw file
/// descriptor value as its token, which is unique for as long as the
/// descriptor owns the fd.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
