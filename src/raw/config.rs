//! Customization of the raw trie's stored types.

use std::borrow::Borrow;
use std::hash::Hash;
use std::marker::PhantomData;

/// Describes what the raw trie stores and how to find the key in it.
///
/// The payload is what actually sits in the leaves; it must be cheap to
/// clone (the structure clones it while building replacement branches) and
/// able to lend out the key it is filed under.
pub trait Config {
    /// The stored value.
    type Payload: Clone + Borrow<Self::Key>;
    /// The key the payload is addressed by.
    type Key: Hash + Eq;
}

/// A configuration where the payload is its own key.
///
/// Useful mostly for tests and set-like wrappers.
pub struct Trivial<T>(PhantomData<T>);

impl<T> Config for Trivial<T>
where
    T: Clone + Hash + Eq,
{
    type Payload = T;
    type Key = T;
}
