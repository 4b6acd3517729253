//! A module containing few debug utilities.
//!
//! In general, they are meant for debugging the *trie itself*, but it is
//! exposed as potentially useful.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use crossbeam_epoch::Guard;

use super::config::Config;
use super::node::{Branch, INode, MainKind};
use super::Raw;

impl<C, S> Raw<C, S>
where
    C: Config,
{
    // Hack: &mut to make sure it is not shared between threads and nobody
    // is modifying the thing right now.
    /// Panics if the trie violates its structural invariants.
    ///
    /// Tombs may legitimately be present (cleanup is lazy), but bitmaps,
    /// commit states and the collision tier must be right in any quiescent
    /// state.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&mut self) {
        use std::sync::atomic::Ordering;

        use super::{rf, RootFlags, LEVEL_BITS, MAX_LEVEL};

        fn check_inode<C: Config>(inode: &INode<C>, level: u32) {
            // Unprotected is fine, we are &mut so nobody else is allowed to
            // do stuff to us at the moment. Relaxed for the same reason.
            let pin = unsafe { crossbeam_epoch::unprotected() };
            let main = inode.main.load(Ordering::Relaxed, pin);
            assert!(!main.is_null(), "An indirection node without a main node");
            let main = unsafe { main.deref() };
            let prev = main.prev.load(Ordering::Relaxed, pin);
            assert!(prev.is_null(), "An uncommitted main node at rest");

            match &main.kind {
                MainKind::Branch(cnode) => {
                    assert_eq!(
                        cnode.bitmap.count_ones() as usize,
                        cnode.children.len(),
                        "Bitmap and child array out of sync"
                    );
                    assert!(level < MAX_LEVEL, "A branch below the collision tier");
                    for child in cnode.children.iter() {
                        if let Branch::Indirection(sub) = child {
                            check_inode(sub, level + LEVEL_BITS);
                        }
                    }
                }
                MainKind::Tomb(_) => {
                    assert!(level > 0, "A tomb can never be the root's main");
                }
                MainKind::List(lnode) => {
                    assert_eq!(MAX_LEVEL, level, "A collision leaf above the last level");
                    assert!(
                        lnode.entries.len() >= 2,
                        "A collision leaf smaller than a pair"
                    );
                    let hash = lnode.entries[0].hash;
                    assert!(
                        lnode.entries.iter().all(|snode| snode.hash == hash),
                        "A collision leaf with differing hashes"
                    );
                }
                MainKind::Failed => panic!("A failed wrapper reachable as main content"),
            }
        }

        let pin = unsafe { crossbeam_epoch::unprotected() };
        let root = self.root.load(Ordering::Relaxed, pin);
        assert!(
            !rf(root).contains(RootFlags::DESCRIPTOR),
            "A descriptor parked in a quiescent root slot"
        );
        check_inode(unsafe { root.deref() }, 0);
    }

    fn print_shape_inode(&self, inode: &INode<C>, fmt: &mut Formatter, pin: &Guard) -> FmtResult
    where
        C::Payload: Debug,
    {
        let main = self.gcas_read(inode, pin);
        match &unsafe { main.deref() }.kind {
            MainKind::Branch(cnode) => {
                write!(fmt, "[{:08x}](", cnode.bitmap)?;
                for child in cnode.children.iter() {
                    match child {
                        Branch::Singleton(snode) => write!(fmt, " {:?}", snode.payload)?,
                        Branch::Indirection(sub) => {
                            write!(fmt, " ")?;
                            self.print_shape_inode(sub, fmt, pin)?;
                        }
                    }
                }
                write!(fmt, " )")
            }
            MainKind::Tomb(snode) => write!(fmt, "†{:?}", snode.payload),
            MainKind::List(lnode) => {
                write!(fmt, "{{")?;
                for snode in &lnode.entries {
                    write!(fmt, " {:?}", snode.payload)?;
                }
                write!(fmt, " }}")
            }
            MainKind::Failed => unreachable!("gcas_read never yields a failed wrapper"),
        }
    }

    fn print_shape(&self, fmt: &mut Formatter) -> FmtResult
    where
        C::Payload: Debug,
    {
        let pin = crossbeam_epoch::pin();
        let root = self.rdcss_read_root(false, &pin);
        self.print_shape_inode(unsafe { root.deref() }, fmt, &pin)
    }
}

/// A pretty-printing wrapper around the raw trie.
///
/// The tree structure, including bitmaps, tombs and collision leaves, is
/// printed if this is used to wrap the raw trie.
pub struct PrintShape<'a, C, S>(pub &'a Raw<C, S>)
where
    C: Config;

impl<C, S> Display for PrintShape<'_, C, S>
where
    C: Config,
    C::Payload: Debug,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        self.0.print_shape(fmt)
    }
}
