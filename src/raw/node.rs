//! The node variants the trie is made of.
//!
//! Everything here is immutable once published, with two exceptions: an
//! [`INode`]'s `main` pointer and a [`Main`]'s `prev` pointer, both of which
//! are only ever touched through CAS by the protocol code in the parent
//! module. The branch algebra (inserting, updating and removing slots,
//! contraction, the two-singleton `dual` ladder) is pure and lives here.

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{Atomic, Shared};
use smallvec::SmallVec;

use super::config::Config;
use super::{LEVEL_BITS, LEVEL_MASK, MAX_LEVEL};

/// An identity tag telling apart logical generations of the trie.
///
/// A fresh generation is minted for the empty trie and for every snapshot.
/// Two generations are equal only if they are the same allocation; the
/// `Arc` exists purely to provide a unique, stable address.
pub(crate) struct Generation(Arc<GenerationTag>);

struct GenerationTag;

impl Generation {
    pub(crate) fn new() -> Self {
        Generation(Arc::new(GenerationTag))
    }
}

impl Clone for Generation {
    fn clone(&self) -> Self {
        Generation(Arc::clone(&self.0))
    }
}

impl PartialEq for Generation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Generation {}

impl Debug for Generation {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(fmt, "Gen({:p})", Arc::as_ptr(&self.0))
    }
}

/// A single key-value carrier, stored directly in a branch slot.
pub(crate) struct SNode<C: Config> {
    pub(crate) hash: u32,
    pub(crate) payload: C::Payload,
}

impl<C: Config> SNode<C> {
    pub(crate) fn new(hash: u32, payload: C::Payload) -> Self {
        SNode { hash, payload }
    }

    /// Does this singleton carry the given key?
    pub(crate) fn matches<Q>(&self, hash: u32, key: &Q) -> bool
    where
        Q: ?Sized + Eq,
        C::Key: Borrow<Q>,
    {
        self.hash == hash && self.payload.borrow().borrow() == key
    }
}

impl<C: Config> Clone for SNode<C> {
    fn clone(&self) -> Self {
        SNode {
            hash: self.hash,
            payload: self.payload.clone(),
        }
    }
}

/// A slot of a branch node.
///
/// Only indirections and singletons can live under a branch; tombs and
/// failed wrappers are main-node kinds and the type rules them out here.
pub(crate) enum Branch<C: Config> {
    Indirection(Arc<INode<C>>),
    Singleton(SNode<C>),
}

impl<C: Config> Clone for Branch<C> {
    fn clone(&self) -> Self {
        match self {
            Branch::Indirection(inode) => Branch::Indirection(Arc::clone(inode)),
            Branch::Singleton(snode) => Branch::Singleton(snode.clone()),
        }
    }
}

/// A branch: up to 32 children, keyed by 5 hash bits, stored densely and
/// indexed through the occupancy bitmap.
pub(crate) struct CNode<C: Config> {
    pub(crate) bitmap: u32,
    pub(crate) children: Box<[Branch<C>]>,
    pub(crate) gen: Generation,
}

impl<C: Config> CNode<C> {
    pub(crate) fn empty(gen: Generation) -> Self {
        CNode {
            bitmap: 0,
            children: Box::new([]),
            gen,
        }
    }

    pub(crate) fn new(bitmap: u32, children: Vec<Branch<C>>, gen: Generation) -> Self {
        debug_assert_eq!(bitmap.count_ones() as usize, children.len());
        CNode {
            bitmap,
            children: children.into_boxed_slice(),
            gen,
        }
    }

    /// The occupancy flag and dense array position for a hash at a level.
    pub(crate) fn flag_pos(&self, hash: u32, level: u32) -> (u32, usize) {
        let idx = (hash >> level) & LEVEL_MASK;
        let flag = 1u32 << idx;
        let pos = (self.bitmap & flag.wrapping_sub(1)).count_ones() as usize;
        (flag, pos)
    }

    pub(crate) fn updated(&self, pos: usize, branch: Branch<C>, gen: Generation) -> Self {
        let mut children = self.children.to_vec();
        children[pos] = branch;
        CNode::new(self.bitmap, children, gen)
    }

    pub(crate) fn inserted(&self, pos: usize, flag: u32, branch: Branch<C>, gen: Generation) -> Self {
        let mut children = Vec::with_capacity(self.children.len() + 1);
        children.extend_from_slice(&self.children[..pos]);
        children.push(branch);
        children.extend_from_slice(&self.children[pos..]);
        CNode::new(self.bitmap | flag, children, gen)
    }

    pub(crate) fn removed(&self, pos: usize, flag: u32, gen: Generation) -> Self {
        let mut children = Vec::with_capacity(self.children.len() - 1);
        children.extend_from_slice(&self.children[..pos]);
        children.extend_from_slice(&self.children[pos + 1..]);
        CNode::new(self.bitmap ^ flag, children, gen)
    }

    /// Reduce a lone-singleton branch to a tomb so the parent can absorb it.
    ///
    /// The root branch (level 0) is never contracted.
    pub(crate) fn contract(self, level: u32) -> MainKind<C> {
        if level > 0 && self.children.len() == 1 {
            if let Branch::Singleton(snode) = &self.children[0] {
                return MainKind::Tomb(snode.clone());
            }
        }
        MainKind::Branch(self)
    }
}

impl<C: Config> Clone for CNode<C> {
    fn clone(&self) -> Self {
        CNode {
            bitmap: self.bitmap,
            children: self.children.to_vec().into_boxed_slice(),
            gen: self.gen.clone(),
        }
    }
}

/// A collision leaf: two or more entries whose 32-bit hashes are fully
/// equal, living below the last branchable level.
pub(crate) struct LNode<C: Config> {
    pub(crate) entries: SmallVec<[SNode<C>; 2]>,
}

impl<C: Config> LNode<C> {
    pub(crate) fn pair(left: SNode<C>, right: SNode<C>) -> Self {
        let mut entries = SmallVec::new();
        entries.push(left);
        entries.push(right);
        LNode { entries }
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&SNode<C>>
    where
        Q: ?Sized + Eq,
        C::Key: Borrow<Q>,
    {
        self.entries
            .iter()
            .find(|snode| snode.payload.borrow().borrow() == key)
    }

    /// A copy with the entry for this key replaced, or appended.
    pub(crate) fn inserted(&self, snode: SNode<C>) -> Self {
        let key: &C::Key = snode.payload.borrow();
        let mut entries: SmallVec<[SNode<C>; 2]> = self
            .entries
            .iter()
            .filter(|e| e.payload.borrow() != key)
            .cloned()
            .collect();
        entries.push(snode);
        LNode { entries }
    }

    /// A copy without the entry for this key.
    ///
    /// A leaf never holds fewer than two entries, so when exactly one
    /// remains it degrades to a tomb and the parent compresses it away.
    pub(crate) fn removed<Q>(&self, key: &Q) -> MainKind<C>
    where
        Q: ?Sized + Eq,
        C::Key: Borrow<Q>,
    {
        let entries: SmallVec<[SNode<C>; 2]> = self
            .entries
            .iter()
            .filter(|e| e.payload.borrow().borrow() != key)
            .cloned()
            .collect();
        if entries.len() == 1 {
            MainKind::Tomb(entries.into_iter().next().expect("just checked the length"))
        } else {
            MainKind::List(LNode { entries })
        }
    }
}

impl<C: Config> Clone for LNode<C> {
    fn clone(&self) -> Self {
        LNode {
            entries: self.entries.clone(),
        }
    }
}

/// What an indirection node's main pointer can point at.
pub(crate) enum MainKind<C: Config> {
    /// A live branch.
    Branch(CNode<C>),
    /// The indirection node is logically dead and holds one last entry,
    /// waiting for the parent to absorb it.
    Tomb(SNode<C>),
    /// A collision leaf.
    List(LNode<C>),
    /// A rolled-back GCAS attempt; the displaced node sits in `prev`.
    Failed,
}

impl<C: Config> Clone for MainKind<C> {
    fn clone(&self) -> Self {
        match self {
            MainKind::Branch(cnode) => MainKind::Branch(cnode.clone()),
            MainKind::Tomb(snode) => MainKind::Tomb(snode.clone()),
            MainKind::List(lnode) => MainKind::List(lnode.clone()),
            MainKind::Failed => unreachable!("failed wrappers are never main content"),
        }
    }
}

/// A main node: the payload kind plus the GCAS auxiliary pointer.
///
/// `prev` is null for a committed node. During a GCAS it points at the node
/// being displaced; for a `Failed` kind it points at the node to restore.
/// It is never an owning pointer except through the retirement protocol in
/// the parent module, so dropping a `Main` must not follow it.
pub(crate) struct Main<C: Config> {
    pub(crate) prev: Atomic<Main<C>>,
    pub(crate) kind: MainKind<C>,
}

impl<C: Config> Main<C> {
    pub(crate) fn new(kind: MainKind<C>) -> Self {
        Main {
            prev: Atomic::null(),
            kind,
        }
    }

    pub(crate) fn branch(cnode: CNode<C>) -> Self {
        Main::new(MainKind::Branch(cnode))
    }

    pub(crate) fn failed(wrapped: Shared<Main<C>>) -> Self {
        Main {
            prev: Atomic::from(wrapped),
            kind: MainKind::Failed,
        }
    }
}

/// The indirection node: the only mutable structural element.
///
/// Pairs the atomically updated main pointer with the generation the node
/// belongs to. The main pointer is never null.
pub(crate) struct INode<C: Config> {
    pub(crate) gen: Generation,
    pub(crate) main: Atomic<Main<C>>,
}

impl<C: Config> INode<C> {
    /// A fresh indirection node over an empty branch of its own generation.
    pub(crate) fn new(gen: Generation) -> Self {
        let empty = CNode::empty(gen.clone());
        INode {
            gen,
            main: Atomic::new(Main::branch(empty)),
        }
    }

    pub(crate) fn with_main(kind: MainKind<C>, gen: Generation) -> Self {
        INode {
            gen,
            main: Atomic::new(Main::new(kind)),
        }
    }
}

impl<C: Config> Drop for INode<C> {
    fn drop(&mut self) {
        // We are the last owner, nobody else can see this node any more.
        // Unprotected + Relaxed are fine for the same reasons as in the
        // trie's own Drop.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let main = self.main.load(Ordering::Relaxed, guard);
            if main.is_null() {
                return;
            }
            let prev = main.deref().prev.load(Ordering::Relaxed, guard);
            if !prev.is_null() {
                if let MainKind::Failed = prev.deref().kind {
                    // A rollback that never ran still owns the wrapper and,
                    // through it, the displaced node.
                    let wrapped = prev.deref().prev.load(Ordering::Relaxed, guard);
                    if !wrapped.is_null() {
                        drop(wrapped.into_owned());
                    }
                    drop(prev.into_owned());
                }
            }
            drop(main.into_owned());
        }
    }
}

/// Builds the main node holding two singletons that share a hash prefix.
///
/// While there are hash bits left the two are pushed down through as many
/// single-slot branches as it takes to tell them apart; once the hash is
/// exhausted they become a collision leaf.
pub(crate) fn dual<C: Config>(
    left: SNode<C>,
    right: SNode<C>,
    level: u32,
    gen: &Generation,
) -> MainKind<C> {
    if level < MAX_LEVEL {
        let left_idx = (left.hash >> level) & LEVEL_MASK;
        let right_idx = (right.hash >> level) & LEVEL_MASK;
        let bitmap = (1u32 << left_idx) | (1u32 << right_idx);

        if left_idx == right_idx {
            let sub = INode::with_main(dual(left, right, level + LEVEL_BITS, gen), gen.clone());
            MainKind::Branch(CNode::new(
                bitmap,
                vec![Branch::Indirection(Arc::new(sub))],
                gen.clone(),
            ))
        } else {
            let (first, second) = if left_idx < right_idx {
                (left, right)
            } else {
                (right, left)
            };
            MainKind::Branch(CNode::new(
                bitmap,
                vec![Branch::Singleton(first), Branch::Singleton(second)],
                gen.clone(),
            ))
        }
    } else {
        MainKind::List(LNode::pair(left, right))
    }
}
