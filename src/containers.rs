//! Generally useful container data structures

/// Hash maps and sets whose iteration order carries no meaning.
///
/// Code that needs a reproducible iteration order (notably the lifter's edge
/// work list) should use an ordered collection instead of these.
pub mod unordered {
    /// A fast hash map whose iteration order is unspecified.
    pub type UnorderedMap<K, V> = rustc_hash::FxHashMap<K, V>;
    /// A fast hash set whose iteration order is unspecified.
    pub type UnorderedSet<T> = rustc_hash::FxHashSet<T>;
}
