/// A cursor over one column family of a snapshot.
///
/// The caller must check `valid()` before calling `key`/`value`. Seeking past
/// the last entry simply invalidates the cursor; it is not an error.
pub trait Cursor: Send {
    /// An iterator is either positioned at a key/value pair, or
    /// not valid. This method returns true iff the iterator is valid.
    fn valid(&self) -> bool;

    /// Position at the first key that is at or past `target`.
    fn seek(&mut self, target: &[u8]);

    /// Position at the first key in the source.
    fn seek_to_first(&mut self);

    /// Moves to the next entry in the source.
    /// REQUIRES: `valid()`
    fn next(&mut self);

    /// The key for the current entry.
    /// REQUIRES: `valid()`
    fn key(&self) -> &[u8];

    /// The value for the current entry.
    /// REQUIRES: `valid()`
    fn value(&self) -> &[u8];
}
