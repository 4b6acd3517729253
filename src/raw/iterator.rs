//! The read-only traversal cursor.

use std::mem;

use arrayvec::ArrayVec;
use crossbeam_epoch::Guard;

use super::config::Config;
use super::node::{Branch, INode, MainKind, SNode};
use super::{Raw, MAX_DEPTH};

unsafe fn extend_lifetime<'a, 'b, T: ?Sized>(r: &'a T) -> &'b T {
    mem::transmute(r)
}

struct Level<'a, C: Config> {
    children: &'a [Branch<C>],
    idx: usize,
}

/// What a collision leaf or a tomb left for the cursor to drain before it
/// goes back to walking the branch stack.
enum Pending<'a, C: Config> {
    None,
    Tomb(&'a SNode<C>),
    Leaf(std::slice::Iter<'a, SNode<C>>),
}

// Notes about the lifetimes:
// The 'a here is actually a lie. We need two things from lifetimes:
// * We must not outlive the snapshot we are iterating through (because its
//   drop just outright destroys the frozen tree).
// * The node references must not outlive the pin we hold.
// * We do not mind us (or the pin) moving around in memory, we are only
//   interested in when its destructor is called. The references don't
//   actually point inside the pin itself.
//
// The lifetime of the pin is the same as of the references we store inside
// of us. We check the lifetime relation of the snapshot and us in the
// constructor, so we won't outlive the snapshot. But technically, the
// lifetime should be something like `'self`, and that's not possible to
// describe.
//
// Therefore we have to make very sure to never return a reference with the
// 'a lifetime, and the extend_lifetime above must only ever be applied to
// the pin.
/// A depth-first cursor over a read-only snapshot.
///
/// Yields every payload exactly once, in unspecified order. The cursor is a
/// view of the frozen snapshot ‒ it never observes writes on the trie the
/// snapshot was taken from.
pub struct Iter<'a, C, S>
where
    C: Config,
{
    trie: &'a Raw<C, S>,
    pin: Guard,
    levels: ArrayVec<[Level<'a, C>; MAX_DEPTH]>,
    pending: Pending<'a, C>,
}

impl<'a, C, S> Iter<'a, C, S>
where
    C: Config,
{
    /// Creates a cursor over a read-only snapshot.
    ///
    /// # Panics
    ///
    /// If the handle is writable. A consistent walk needs a frozen tree;
    /// take a [`snapshot_read_only`][Raw::snapshot_read_only] first.
    pub fn new<'m: 'a>(map: &'m Raw<C, S>) -> Self {
        assert!(
            map.is_read_only(),
            "Traversal is only defined on a read-only snapshot"
        );
        let pin = crossbeam_epoch::pin();
        let mut iter = Iter {
            trie: map,
            pin,
            levels: ArrayVec::new(),
            pending: Pending::None,
        };
        let pin: &'a Guard = unsafe { extend_lifetime(&iter.pin) };
        let root = iter.trie.rdcss_read_root(false, pin);
        let root = unsafe { root.deref() };
        iter.read_inode(root);
        iter
    }

    /// Descends into an indirection node, stacking a branch frame or
    /// parking a leaf for draining.
    fn read_inode(&mut self, inode: &'a INode<C>) {
        let pin: &'a Guard = unsafe { extend_lifetime(&self.pin) };
        let main = self.trie.gcas_read(inode, pin);
        match &unsafe { main.deref() }.kind {
            MainKind::Branch(cnode) => {
                self.levels.push(Level {
                    children: &cnode.children,
                    idx: 0,
                });
            }
            // A tomb on the frozen side is a one-entry leaf nobody will
            // ever compress.
            MainKind::Tomb(snode) => self.pending = Pending::Tomb(snode),
            MainKind::List(lnode) => self.pending = Pending::Leaf(lnode.entries.iter()),
            MainKind::Failed => unreachable!("gcas_read never yields a failed wrapper"),
        }
    }

    // Not an iterator because this borrows out of the iterator itself (and
    // effectively its pin).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&C::Payload> {
        loop {
            match mem::replace(&mut self.pending, Pending::None) {
                Pending::Tomb(snode) => return Some(&snode.payload),
                Pending::Leaf(mut entries) => {
                    if let Some(snode) = entries.next() {
                        self.pending = Pending::Leaf(entries);
                        return Some(&snode.payload);
                    }
                }
                Pending::None => (),
            }

            let top = self.levels.last_mut()?;
            let children = top.children;
            if top.idx < children.len() {
                let child = &children[top.idx];
                top.idx += 1;
                match child {
                    Branch::Singleton(snode) => return Some(&snode.payload),
                    Branch::Indirection(inode) => self.read_inode(inode),
                }
            } else {
                self.levels.pop();
            }
        }
    }
}
