//! The core implementation of the concurrent, snapshottable hash trie.
//!
//! This module contains the [`Raw`][crate::raw::Raw] type, the engine under
//! the typed map in this crate. It is exposed to allow wrapping it into
//! further APIs, but is probably not the best thing for general use.
//!
//! Two cooperating lock-free protocols drive every operation:
//!
//! * *GCAS* updates an indirection node's main pointer through an auxiliary
//!   `prev` field, so that a write racing a snapshot is either committed
//!   before the snapshot's root swap or rolled back after it.
//! * *RDCSS* swings the root pointer to a new indirection node, conditioned
//!   on the old root's main content being the one that was observed. A
//!   descriptor parked in the root slot is completed by whichever thread
//!   meets it first.
//!
//! All protocol CASes and loads use `SeqCst`. The commit step couples three
//! independent locations (the root slot, a main pointer and a `prev` field)
//! and the linearization argument leans on them agreeing about order; the
//! few extra fences are noise next to the CAS traffic itself.
//!
//! Memory reclamation is split: every atomically swapped allocation (main
//! nodes, root indirection nodes, descriptors) is epoch-managed and has
//! exactly one owning slot, which is what makes `defer_destroy` sound;
//! immutable shared structure (branch children, payloads) is `Arc`-shared.

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

pub mod config;
pub mod debug;
pub mod iterator;
pub(crate) mod node;

use self::config::Config;
use self::node::{dual, Branch, CNode, Generation, INode, Main, MainKind, SNode};
use crate::ReadOnlyError;

pub(crate) const LEVEL_BITS: u32 = 5;
pub(crate) const LEVEL_MASK: u32 = 0b1_1111;
pub(crate) const HASH_BITS: u32 = 32;
/// The level at which branching stops: six full 5-bit steps consume the
/// 32-bit hash, the seventh step sees only the two overflow bits, and
/// anything still colliding past that goes into a collision leaf.
pub(crate) const MAX_LEVEL: u32 = 35;
/// Indirection depth of the deepest possible path: seven branch tiers plus
/// the collision tier.
pub(crate) const MAX_DEPTH: usize = ((HASH_BITS + LEVEL_BITS - 1) / LEVEL_BITS) as usize + 1;

bitflags! {
    /// Flags living in the unused low bits of the root pointer.
    ///
    /// Indirection nodes and descriptors align to a machine word at least,
    /// so there is always a bit to spare.
    struct RootFlags: usize {
        /// The root slot currently holds an RDCSS descriptor, not an
        /// indirection node. Whoever reads it must help complete it.
        const DESCRIPTOR = 0b01;
    }
}

/// Extracts [`RootFlags`] from a root-slot pointer.
fn rf<C: Config>(node: Shared<INode<C>>) -> RootFlags {
    RootFlags::from_bits(node.tag()).expect("Invalid root flags")
}

const OUTCOME_PENDING: usize = 0;
const OUTCOME_COMMITTED: usize = 1;
const OUTCOME_ABORTED: usize = 2;

/// The RDCSS descriptor parked in the root slot while a root swap decides.
///
/// The `old`/`new`/`expected` fields are plain pointer storage written once
/// at construction; `Atomic` is used for them only because it provides the
/// right `Send`/`Sync` plumbing for an epoch-managed allocation. The
/// descriptor owns nothing ‒ completion hands the slot to `new` or back to
/// `old` and retires the descriptor itself.
///
/// `outcome` is decided by CAS *before* the root slot is swung. Without a
/// tracing collector the originator has to learn reliably whether its swap
/// won; deciding first closes the window in which a helper has swung the
/// root but not yet published the verdict.
struct Rdcss<C: Config> {
    outcome: AtomicUsize,
    old: Atomic<INode<C>>,
    new: Atomic<INode<C>>,
    expected: Atomic<Main<C>>,
}

/// Type-casts a tagged root pointer to the descriptor it hides.
unsafe fn load_desc<'a, C: Config>(node: Shared<'a, INode<C>>) -> &'a Rdcss<C> {
    assert!(
        rf(node).contains(RootFlags::DESCRIPTOR),
        "Tried to load a descriptor from a plain root pointer"
    );
    (node.as_raw() as usize as *const Rdcss<C>)
        .as_ref()
        .expect("A null pointer with the descriptor flag found")
}

/// Moves a descriptor behind an [`Owned`] root pointer with the right tag.
fn owned_desc<C: Config>(desc: Rdcss<C>) -> Owned<INode<C>> {
    unsafe {
        Owned::<INode<C>>::from_raw(Box::into_raw(Box::new(desc)) as usize as *mut _)
            .with_tag(RootFlags::DESCRIPTOR.bits())
    }
}

/// Type-casts and immediately drops a never-published descriptor.
unsafe fn drop_desc<C: Config>(ptr: Shared<INode<C>>) {
    assert!(
        rf(ptr).contains(RootFlags::DESCRIPTOR),
        "Tried to drop a plain root pointer as a descriptor"
    );
    drop(Owned::from_raw(ptr.as_raw() as usize as *mut Rdcss<C>));
}

/// Schedules a retired descriptor for destruction once the epoch ends.
unsafe fn defer_drop_desc<C: Config>(guard: &Guard, ptr: Shared<INode<C>>) {
    assert!(
        rf(ptr).contains(RootFlags::DESCRIPTOR),
        "Tried to retire a plain root pointer as a descriptor"
    );
    let desc = Shared::from(ptr.as_raw() as usize as *const Rdcss<C>);
    guard.defer_destroy(desc);
}

/// What to do when an insert meets an already present key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraverseMode {
    /// Replace the entry, reporting the one it displaced.
    Overwrite,
    /// Keep the entry, reporting it; nothing is written.
    IfAbsent,
}

enum Find<'g, C: Config> {
    Hit(&'g C::Payload),
    Miss,
    Restart,
}

enum Put<'g, C: Config> {
    Done(Option<&'g C::Payload>),
    Restart,
}

enum Take<'g, C: Config> {
    Taken(&'g C::Payload),
    Miss,
    Restart,
}

/// The raw snapshottable hash trie.
///
/// This provides the low level data structure: lock-free lookup, insert and
/// remove, plus constant-time snapshots through a generation sweep. It does
/// not provide a user friendly interface ‒ it exists to separate the single
/// implementation of the core protocols from the interfaces wrapped around
/// it.
///
/// The stored types and key extraction are described by the [`Config`] type
/// parameter.
///
/// As a general rule, methods take a [`crossbeam_epoch`] [`Guard`] and
/// return borrowed payloads valid for that guard. Even `insert` and `remove`
/// return borrows: another thread might still be reading the displaced
/// entry, so it is only scheduled for destruction once the epoch ends.
pub struct Raw<C: Config, S> {
    hash_builder: S,
    root: Atomic<INode<C>>,
    read_only: bool,
}

impl<C, S> Raw<C, S>
where
    C: Config,
{
    /// Constructs an empty trie from the given hasher.
    pub fn with_hasher(hash_builder: S) -> Self {
        // Internal sanity checks: the descriptor flag lives in pointer tag
        // bits, so both things a root pointer can address must leave one
        // bit of alignment to spare. If this ever fails, open a bug report.
        assert!(
            mem::align_of::<INode<C>>().trailing_zeros() >= RootFlags::all().bits().count_ones(),
            "BUG: Alignment of INode is not large enough to store the root flags",
        );
        assert!(
            mem::align_of::<Rdcss<C>>().trailing_zeros() >= RootFlags::all().bits().count_ones(),
            "BUG: Alignment of the descriptor is not large enough to store the root flags",
        );
        Self {
            hash_builder,
            root: Atomic::new(INode::new(Generation::new())),
            read_only: false,
        }
    }

    /// Access to the hasher instance.
    pub fn hash_builder(&self) -> &S {
        &self.hash_builder
    }

    /// Is this handle a frozen snapshot?
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Checks for emptiness.
    ///
    /// Inherently racy on a writable trie ‒ another thread may add or
    /// remove entries between the check and whatever acts on it.
    pub fn is_empty(&self, guard: &Guard) -> bool {
        let root = self.rdcss_read_root(false, guard);
        let main = self.gcas_read(unsafe { root.deref() }, guard);
        match &unsafe { main.deref() }.kind {
            MainKind::Branch(cnode) => cnode.bitmap == 0,
            _ => false,
        }
    }

    // ---- GCAS ----

    /// Reads an indirection node's committed main node, helping an
    /// in-flight write to a verdict if one is met.
    fn gcas_read<'g>(&self, inode: &INode<C>, guard: &'g Guard) -> Shared<'g, Main<C>> {
        let main = inode.main.load(Ordering::SeqCst, guard);
        let prev = unsafe { main.deref() }.prev.load(Ordering::SeqCst, guard);
        if prev.is_null() {
            main
        } else {
            self.gcas_commit(inode, main, guard)
        }
    }

    /// The commit step: drives a pending `prev` to a verdict.
    ///
    /// Returns the node that ended up committed in the indirection node.
    /// The root is re-read on every round even where the branch taken does
    /// not consult it ‒ the double read is what keeps a write started
    /// before a snapshot from committing after it.
    fn gcas_commit<'g>(
        &self,
        inode: &INode<C>,
        mut main: Shared<'g, Main<C>>,
        guard: &'g Guard,
    ) -> Shared<'g, Main<C>> {
        loop {
            let prev = unsafe { main.deref() }.prev.load(Ordering::SeqCst, guard);
            let root = self.rdcss_read_root(true, guard);

            if prev.is_null() {
                return main;
            }

            match unsafe { prev.deref() }.kind {
                MainKind::Failed => {
                    // Roll the failed write back to the node it displaced.
                    let wrapped = unsafe { prev.deref() }.prev.load(Ordering::SeqCst, guard);
                    match inode
                        .main
                        .compare_and_set(main, wrapped, Ordering::SeqCst, guard)
                    {
                        Ok(_) => unsafe {
                            // The failed node and its wrapper are now
                            // unreachable; the restored node lives on.
                            guard.defer_destroy(main);
                            guard.defer_destroy(prev);
                            return wrapped;
                        },
                        Err(_) => {
                            main = inode.main.load(Ordering::SeqCst, guard);
                        }
                    }
                }
                _ => {
                    if unsafe { root.deref() }.gen == inode.gen && !self.read_only {
                        // Same generation: try to commit.
                        match unsafe { main.deref() }.prev.compare_and_set(
                            prev,
                            Shared::null(),
                            Ordering::SeqCst,
                            guard,
                        ) {
                            Ok(_) => unsafe {
                                // `prev` was the displaced main node and
                                // this field held its last reference.
                                guard.defer_destroy(prev);
                                return main;
                            },
                            Err(_) => (),
                        }
                    } else {
                        // The trie was snapshotted under us (or this side is
                        // frozen): mark the write failed so helpers roll it
                        // back instead of committing across the boundary.
                        let _ = unsafe { main.deref() }.prev.compare_and_set(
                            prev,
                            Owned::new(Main::failed(prev)),
                            Ordering::SeqCst,
                            guard,
                        );
                        main = inode.main.load(Ordering::SeqCst, guard);
                    }
                }
            }
        }
    }

    /// Generation-aware compare-and-set of an indirection node's main node.
    ///
    /// True iff the write committed; false means nothing stayed published
    /// and the caller restarts from the root.
    fn gcas<'g>(
        &self,
        inode: &INode<C>,
        old: Shared<'g, Main<C>>,
        new: Main<C>,
        guard: &'g Guard,
    ) -> bool {
        new.prev.store(old, Ordering::SeqCst);
        match inode
            .main
            .compare_and_set(old, Owned::new(new), Ordering::SeqCst, guard)
        {
            Ok(published) => {
                self.gcas_commit(inode, published, guard);
                unsafe { published.deref() }
                    .prev
                    .load(Ordering::SeqCst, guard)
                    .is_null()
            }
            // The CAS failed and the Err drops the owned node; nothing was
            // published and `old` is still in place.
            Err(_) => false,
        }
    }

    // ---- RDCSS ----

    /// Reads the current root, helping any descriptor met on the way.
    ///
    /// `abort` is set by reads that merely sample the root (the GCAS commit
    /// step) so they do not linearize somebody's snapshot prematurely.
    fn rdcss_read_root<'g>(&self, abort: bool, guard: &'g Guard) -> Shared<'g, INode<C>> {
        let root = self.root.load(Ordering::SeqCst, guard);
        if rf(root).contains(RootFlags::DESCRIPTOR) {
            self.rdcss_complete(abort, guard)
        } else {
            root
        }
    }

    /// Drives a parked descriptor to its verdict and clears the slot.
    fn rdcss_complete<'g>(&self, abort: bool, guard: &'g Guard) -> Shared<'g, INode<C>> {
        loop {
            let current = self.root.load(Ordering::SeqCst, guard);
            if !rf(current).contains(RootFlags::DESCRIPTOR) {
                return current;
            }
            let desc = unsafe { load_desc(current) };
            let old = desc.old.load(Ordering::Relaxed, guard);
            let new = desc.new.load(Ordering::Relaxed, guard);

            // Decide the outcome first; the slot follows the decision. Once
            // decided, every helper acts on the verdict, whatever its own
            // intent was.
            let mut outcome = desc.outcome.load(Ordering::SeqCst);
            if outcome == OUTCOME_PENDING {
                let decided = if abort {
                    OUTCOME_ABORTED
                } else {
                    let old_main = self.gcas_read(unsafe { old.deref() }, guard);
                    let expected = desc.expected.load(Ordering::Relaxed, guard);
                    if old_main.as_raw() == expected.as_raw() {
                        OUTCOME_COMMITTED
                    } else {
                        OUTCOME_ABORTED
                    }
                };
                let _ = desc.outcome.compare_exchange(
                    OUTCOME_PENDING,
                    decided,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                outcome = desc.outcome.load(Ordering::SeqCst);
            }

            let replacement = if outcome == OUTCOME_COMMITTED { new } else { old };
            match self
                .root
                .compare_and_set(current, replacement, Ordering::SeqCst, guard)
            {
                Ok(_) => {
                    unsafe { defer_drop_desc(guard, current) };
                    return replacement;
                }
                Err(_) => (),
            }
        }
    }

    /// Installs `new_root` in place of `old`, provided the old root's main
    /// node is still `expected` at the decision point.
    ///
    /// On false nothing was swapped and `new_root` is gone.
    fn rdcss_root<'g>(
        &self,
        old: Shared<'g, INode<C>>,
        expected: Shared<'g, Main<C>>,
        new_root: Owned<INode<C>>,
        guard: &'g Guard,
    ) -> bool {
        let new_ptr = new_root.into_shared(guard);
        let desc = owned_desc(Rdcss {
            outcome: AtomicUsize::new(OUTCOME_PENDING),
            old: Atomic::from(old),
            new: Atomic::from(new_ptr),
            expected: Atomic::from(expected),
        })
        .into_shared(guard);

        match self.root.compare_and_set(old, desc, Ordering::SeqCst, guard) {
            Ok(_) => {
                self.rdcss_complete(false, guard);
                let committed =
                    unsafe { load_desc(desc) }.outcome.load(Ordering::SeqCst) == OUTCOME_COMMITTED;
                if !committed {
                    // The fresh root never became visible.
                    unsafe { guard.defer_destroy(new_ptr) };
                }
                committed
            }
            Err(_) => unsafe {
                // The descriptor never made it into the slot; reclaim both
                // it and the root it was carrying.
                drop_desc(desc);
                drop(new_ptr.into_owned());
                false
            },
        }
    }

    // ---- generation plumbing ----

    /// A copy of an indirection node re-anchored to `gen`.
    ///
    /// The main allocation is cloned rather than aliased: main nodes are
    /// immutable, so the clone is the same node as far as readers care, and
    /// unique ownership is what lets retirement free the original eagerly.
    fn copied_inode(&self, inode: &INode<C>, gen: Generation, guard: &Guard) -> INode<C> {
        let main = self.gcas_read(inode, guard);
        let kind = unsafe { main.deref() }.kind.clone();
        INode {
            gen,
            main: Atomic::new(Main::new(kind)),
        }
    }

    /// A copy of a branch with every child indirection node re-anchored to
    /// `gen`. Renewal is lazy: it runs only along paths writers actually
    /// touch after a snapshot.
    fn renewed(&self, cnode: &CNode<C>, gen: &Generation, guard: &Guard) -> CNode<C> {
        let children = cnode
            .children
            .iter()
            .map(|child| match child {
                Branch::Indirection(inode) => Branch::Indirection(Arc::new(self.copied_inode(
                    inode,
                    gen.clone(),
                    guard,
                ))),
                Branch::Singleton(snode) => Branch::Singleton(snode.clone()),
            })
            .collect();
        CNode::new(cnode.bitmap, children, gen.clone())
    }

    /// The compressed form of a branch: dead children resurrected into
    /// singletons, then the whole thing contracted if only one remains.
    fn compressed(
        &self,
        cnode: &CNode<C>,
        level: u32,
        gen: &Generation,
        guard: &Guard,
    ) -> MainKind<C> {
        let children = cnode
            .children
            .iter()
            .map(|child| match child {
                Branch::Indirection(inode) => {
                    let main = self.gcas_read(inode, guard);
                    match &unsafe { main.deref() }.kind {
                        MainKind::Tomb(snode) => Branch::Singleton(snode.clone()),
                        _ => child.clone(),
                    }
                }
                Branch::Singleton(_) => child.clone(),
            })
            .collect();
        CNode::new(cnode.bitmap, children, gen.clone()).contract(level)
    }

    /// Replaces a parent's main node with its compressed form.
    ///
    /// Best effort: a failed CAS is ignored, the next traversal through the
    /// same spot triggers it again.
    fn clean(&self, parent: &INode<C>, level: u32, gen: &Generation, guard: &Guard) {
        let main = self.gcas_read(parent, guard);
        if let MainKind::Branch(cnode) = &unsafe { main.deref() }.kind {
            let compressed = self.compressed(cnode, level, gen, guard);
            let _ = self.gcas(parent, main, Main::new(compressed), guard);
        }
    }

    /// Absorbs a tombed child into its parent: the slot holding the dead
    /// indirection node is replaced by the tomb's singleton and the parent
    /// re-contracted.
    ///
    /// Retries while the CAS contends and the trie still belongs to the
    /// generation the removal started in; once a snapshot moved the trie
    /// on, the stale side's cleanup belongs to whoever traverses it next.
    fn clean_parent(
        &self,
        parent: &INode<C>,
        inode: &INode<C>,
        tomb: &SNode<C>,
        hash: u32,
        level: u32,
        start_gen: &Generation,
        guard: &Guard,
    ) {
        loop {
            let parent_main = self.gcas_read(parent, guard);
            let cnode = match &unsafe { parent_main.deref() }.kind {
                MainKind::Branch(cnode) => cnode,
                _ => return,
            };
            let (flag, pos) = cnode.flag_pos(hash, level - LEVEL_BITS);
            if cnode.bitmap & flag == 0 {
                return;
            }
            match &cnode.children[pos] {
                Branch::Indirection(child) if std::ptr::eq(Arc::as_ptr(child), inode) => (),
                _ => return,
            }
            let absorbed = cnode
                .updated(pos, Branch::Singleton(tomb.clone()), inode.gen.clone())
                .contract(level - LEVEL_BITS);
            if self.gcas(parent, parent_main, Main::new(absorbed), guard) {
                return;
            }
            let root = self.rdcss_read_root(false, guard);
            if unsafe { root.deref() }.gen != *start_gen {
                return;
            }
        }
    }
}

impl<C, S> Raw<C, S>
where
    C: Config,
    S: BuildHasher,
{
    /// Computes the 32-bit hash of a key.
    ///
    /// The trie addresses exactly 32 bits, five per level; the upper half
    /// of the hasher's output is dropped.
    fn hash<Q>(&self, key: &Q) -> u32
    where
        Q: ?Sized + Hash,
    {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }

    /// Looks up a value.
    pub fn get<'r, 's, 'g, Q>(&'s self, key: &Q, guard: &'g Guard) -> Option<&'r C::Payload>
    where
        's: 'r,
        'g: 'r,
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
    {
        let hash = self.hash(key);
        loop {
            let root = self.rdcss_read_root(false, guard);
            let root = unsafe { root.deref() };
            match self.lookup_in(root, key, hash, 0, None, &root.gen, guard) {
                Find::Hit(payload) => return Some(payload),
                Find::Miss => return None,
                Find::Restart => (),
            }
        }
    }

    /// Inserts a payload, or keeps an existing one, depending on the mode.
    ///
    /// `Ok(None)` means the entry is new. `Ok(Some(prev))` is the displaced
    /// entry under [`TraverseMode::Overwrite`], or the preserved existing
    /// entry under [`TraverseMode::IfAbsent`] (in which case nothing was
    /// written).
    pub fn insert<'r, 's, 'g>(
        &'s self,
        payload: C::Payload,
        mode: TraverseMode,
        guard: &'g Guard,
    ) -> Result<Option<&'r C::Payload>, ReadOnlyError>
    where
        's: 'r,
        'g: 'r,
    {
        if self.read_only {
            return Err(ReadOnlyError);
        }
        let key: &C::Key = payload.borrow();
        let hash = self.hash(key);
        loop {
            let root = self.rdcss_read_root(false, guard);
            let root = unsafe { root.deref() };
            match self.insert_in(root, &payload, hash, 0, mode, None, &root.gen, guard) {
                Put::Done(prev) => return Ok(prev),
                Put::Restart => (),
            }
        }
    }

    /// Removes the entry for a key, if the witness agrees.
    ///
    /// The witness sees the payload about to be removed; returning false
    /// turns the removal into a miss. Use `|_| true` for an unconditional
    /// remove.
    pub fn remove<'r, 's, 'g, Q, F>(
        &'s self,
        key: &Q,
        witness: F,
        guard: &'g Guard,
    ) -> Result<Option<&'r C::Payload>, ReadOnlyError>
    where
        's: 'r,
        'g: 'r,
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
        F: Fn(&C::Payload) -> bool,
    {
        if self.read_only {
            return Err(ReadOnlyError);
        }
        let hash = self.hash(key);
        loop {
            let root = self.rdcss_read_root(false, guard);
            let root = unsafe { root.deref() };
            match self.remove_in(root, key, &witness, hash, 0, None, &root.gen, guard) {
                Take::Taken(payload) => return Ok(Some(payload)),
                Take::Miss => return Ok(None),
                Take::Restart => (),
            }
        }
    }

    fn lookup_in<'g, Q>(
        &self,
        inode: &'g INode<C>,
        key: &Q,
        hash: u32,
        level: u32,
        parent: Option<&'g INode<C>>,
        start_gen: &Generation,
        guard: &'g Guard,
    ) -> Find<'g, C>
    where
        Q: ?Sized + Eq,
        C::Key: Borrow<Q>,
    {
        let main = self.gcas_read(inode, guard);
        match &unsafe { main.deref() }.kind {
            MainKind::Branch(cnode) => {
                let (flag, pos) = cnode.flag_pos(hash, level);
                if cnode.bitmap & flag == 0 {
                    return Find::Miss;
                }
                match &cnode.children[pos] {
                    Branch::Indirection(child) => {
                        if self.read_only || child.gen == *start_gen {
                            self.lookup_in(
                                child,
                                key,
                                hash,
                                level + LEVEL_BITS,
                                Some(inode),
                                start_gen,
                                guard,
                            )
                        } else {
                            // A subtree from before the snapshot: renew it
                            // here and retry this level.
                            let renewed = self.renewed(cnode, start_gen, guard);
                            if self.gcas(inode, main, Main::branch(renewed), guard) {
                                self.lookup_in(inode, key, hash, level, parent, start_gen, guard)
                            } else {
                                Find::Restart
                            }
                        }
                    }
                    Branch::Singleton(snode) => {
                        if snode.matches(hash, key) {
                            Find::Hit(&snode.payload)
                        } else {
                            Find::Miss
                        }
                    }
                }
            }
            MainKind::Tomb(snode) => {
                if self.read_only {
                    // Nobody ever compresses a frozen snapshot; the tomb is
                    // as good as a singleton here.
                    if snode.matches(hash, key) {
                        Find::Hit(&snode.payload)
                    } else {
                        Find::Miss
                    }
                } else {
                    let parent = parent.expect("a tomb can never be the root's main");
                    self.clean(parent, level - LEVEL_BITS, &inode.gen, guard);
                    Find::Restart
                }
            }
            MainKind::List(lnode) => match lnode.get(key) {
                Some(snode) => Find::Hit(&snode.payload),
                None => Find::Miss,
            },
            MainKind::Failed => unreachable!("gcas_read never yields a failed wrapper"),
        }
    }

    fn insert_in<'g>(
        &self,
        inode: &'g INode<C>,
        payload: &C::Payload,
        hash: u32,
        level: u32,
        mode: TraverseMode,
        parent: Option<&'g INode<C>>,
        start_gen: &Generation,
        guard: &'g Guard,
    ) -> Put<'g, C> {
        let key: &C::Key = payload.borrow();
        let main = self.gcas_read(inode, guard);
        match &unsafe { main.deref() }.kind {
            MainKind::Branch(cnode) => {
                let (flag, pos) = cnode.flag_pos(hash, level);
                if cnode.bitmap & flag != 0 {
                    match &cnode.children[pos] {
                        Branch::Indirection(child) => {
                            if child.gen == *start_gen {
                                self.insert_in(
                                    child,
                                    payload,
                                    hash,
                                    level + LEVEL_BITS,
                                    mode,
                                    Some(inode),
                                    start_gen,
                                    guard,
                                )
                            } else {
                                let renewed = self.renewed(cnode, start_gen, guard);
                                if self.gcas(inode, main, Main::branch(renewed), guard) {
                                    self.insert_in(
                                        inode, payload, hash, level, mode, parent, start_gen, guard,
                                    )
                                } else {
                                    Put::Restart
                                }
                            }
                        }
                        Branch::Singleton(snode) => {
                            if snode.matches(hash, key) {
                                if mode == TraverseMode::IfAbsent {
                                    return Put::Done(Some(&snode.payload));
                                }
                                let replacement =
                                    Branch::Singleton(SNode::new(hash, payload.clone()));
                                let updated = cnode.updated(pos, replacement, inode.gen.clone());
                                if self.gcas(inode, main, Main::branch(updated), guard) {
                                    Put::Done(Some(&snode.payload))
                                } else {
                                    Put::Restart
                                }
                            } else {
                                // Distinct keys share the slot: push both
                                // down until their hashes part ways.
                                let renewed = if cnode.gen == inode.gen {
                                    cnode.clone()
                                } else {
                                    self.renewed(cnode, &inode.gen, guard)
                                };
                                let sub = dual(
                                    snode.clone(),
                                    SNode::new(hash, payload.clone()),
                                    level + LEVEL_BITS,
                                    &inode.gen,
                                );
                                let child = INode::with_main(sub, inode.gen.clone());
                                let updated = renewed.updated(
                                    pos,
                                    Branch::Indirection(Arc::new(child)),
                                    inode.gen.clone(),
                                );
                                if self.gcas(inode, main, Main::branch(updated), guard) {
                                    Put::Done(None)
                                } else {
                                    Put::Restart
                                }
                            }
                        }
                    }
                } else {
                    let renewed = if cnode.gen == inode.gen {
                        cnode.clone()
                    } else {
                        self.renewed(cnode, &inode.gen, guard)
                    };
                    let inserted = renewed.inserted(
                        pos,
                        flag,
                        Branch::Singleton(SNode::new(hash, payload.clone())),
                        inode.gen.clone(),
                    );
                    if self.gcas(inode, main, Main::branch(inserted), guard) {
                        Put::Done(None)
                    } else {
                        Put::Restart
                    }
                }
            }
            MainKind::Tomb(_) => {
                let parent = parent.expect("a tomb can never be the root's main");
                self.clean(parent, level - LEVEL_BITS, &inode.gen, guard);
                Put::Restart
            }
            MainKind::List(lnode) => {
                let existing = lnode.get(key);
                if let (Some(snode), TraverseMode::IfAbsent) = (existing, mode) {
                    return Put::Done(Some(&snode.payload));
                }
                let updated = lnode.inserted(SNode::new(hash, payload.clone()));
                if self.gcas(inode, main, Main::new(MainKind::List(updated)), guard) {
                    Put::Done(existing.map(|snode| &snode.payload))
                } else {
                    Put::Restart
                }
            }
            MainKind::Failed => unreachable!("gcas_read never yields a failed wrapper"),
        }
    }

    fn remove_in<'g, Q, F>(
        &self,
        inode: &'g INode<C>,
        key: &Q,
        witness: &F,
        hash: u32,
        level: u32,
        parent: Option<&'g INode<C>>,
        start_gen: &Generation,
        guard: &'g Guard,
    ) -> Take<'g, C>
    where
        Q: ?Sized + Eq,
        C::Key: Borrow<Q>,
        F: Fn(&C::Payload) -> bool,
    {
        let main = self.gcas_read(inode, guard);
        let result = match &unsafe { main.deref() }.kind {
            MainKind::Branch(cnode) => {
                let (flag, pos) = cnode.flag_pos(hash, level);
                if cnode.bitmap & flag == 0 {
                    Take::Miss
                } else {
                    match &cnode.children[pos] {
                        Branch::Indirection(child) => {
                            if child.gen == *start_gen {
                                self.remove_in(
                                    child,
                                    key,
                                    witness,
                                    hash,
                                    level + LEVEL_BITS,
                                    Some(inode),
                                    start_gen,
                                    guard,
                                )
                            } else {
                                let renewed = self.renewed(cnode, start_gen, guard);
                                if self.gcas(inode, main, Main::branch(renewed), guard) {
                                    self.remove_in(
                                        inode, key, witness, hash, level, parent, start_gen, guard,
                                    )
                                } else {
                                    Take::Restart
                                }
                            }
                        }
                        Branch::Singleton(snode) => {
                            if snode.matches(hash, key) && witness(&snode.payload) {
                                let contracted =
                                    cnode.removed(pos, flag, inode.gen.clone()).contract(level);
                                if self.gcas(inode, main, Main::new(contracted), guard) {
                                    Take::Taken(&snode.payload)
                                } else {
                                    Take::Restart
                                }
                            } else {
                                Take::Miss
                            }
                        }
                    }
                }
            }
            MainKind::Tomb(_) => {
                let parent = parent.expect("a tomb can never be the root's main");
                self.clean(parent, level - LEVEL_BITS, &inode.gen, guard);
                Take::Restart
            }
            MainKind::List(lnode) => match lnode.get(key) {
                Some(snode) if witness(&snode.payload) => {
                    let removed = lnode.removed(key);
                    if self.gcas(inode, main, Main::new(removed), guard) {
                        Take::Taken(&snode.payload)
                    } else {
                        Take::Restart
                    }
                }
                _ => Take::Miss,
            },
            MainKind::Failed => unreachable!("gcas_read never yields a failed wrapper"),
        };

        // A successful removal may have left this node a tomb; absorb it
        // into the parent eagerly instead of waiting for the next reader.
        if let Take::Taken(_) = result {
            if let Some(parent) = parent {
                let current = self.gcas_read(inode, guard);
                if let MainKind::Tomb(snode) = &unsafe { current.deref() }.kind {
                    self.clean_parent(parent, inode, snode, hash, level, start_gen, guard);
                }
            }
        }

        result
    }
}

impl<C, S> Raw<C, S>
where
    C: Config,
    S: Clone,
{
    /// An O(1) writable fork of this trie.
    ///
    /// Both the original and the fork keep the shared structure and copy
    /// subtrees lazily as their writers touch them. Fails on a read-only
    /// handle ‒ snapshots of snapshots come from the originating trie.
    pub fn snapshot(&self, guard: &Guard) -> Result<Self, ReadOnlyError> {
        if self.read_only {
            return Err(ReadOnlyError);
        }
        loop {
            let root = self.rdcss_read_root(false, guard);
            let root_ref = unsafe { root.deref() };
            let expected = self.gcas_read(root_ref, guard);
            let renewed = Owned::new(self.copied_inode(root_ref, Generation::new(), guard));
            if self.rdcss_root(root, expected, renewed, guard) {
                // The old root is off the slot and frozen; fork one more
                // copy for the caller and let the old one go.
                let fork = self.copied_inode(root_ref, Generation::new(), guard);
                unsafe { guard.defer_destroy(root) };
                return Ok(Raw {
                    hash_builder: self.hash_builder.clone(),
                    root: Atomic::new(fork),
                    read_only: false,
                });
            }
        }
    }

    /// An O(1) frozen view of this trie.
    ///
    /// The returned handle rejects writes, reads through tombs in place and
    /// is the only kind of handle the traversal cursor accepts.
    pub fn snapshot_read_only(&self, guard: &Guard) -> Result<Self, ReadOnlyError> {
        if self.read_only {
            return Err(ReadOnlyError);
        }
        loop {
            let root = self.rdcss_read_root(false, guard);
            let root_ref = unsafe { root.deref() };
            let expected = self.gcas_read(root_ref, guard);
            let renewed = Owned::new(self.copied_inode(root_ref, Generation::new(), guard));
            if self.rdcss_root(root, expected, renewed, guard) {
                // The swapped-out root itself becomes the snapshot's root;
                // ownership moves into the new handle.
                return Ok(Raw {
                    hash_builder: self.hash_builder.clone(),
                    root: Atomic::from(root),
                    read_only: true,
                });
            }
        }
    }

    /// Atomically replaces the whole content with an empty trie.
    pub fn clear(&self, guard: &Guard) -> Result<(), ReadOnlyError> {
        if self.read_only {
            return Err(ReadOnlyError);
        }
        loop {
            let root = self.rdcss_read_root(false, guard);
            let root_ref = unsafe { root.deref() };
            let expected = self.gcas_read(root_ref, guard);
            let empty = Owned::new(INode::new(Generation::new()));
            if self.rdcss_root(root, expected, empty, guard) {
                unsafe { guard.defer_destroy(root) };
                return Ok(());
            }
        }
    }
}

impl<C: Config, S> Drop for Raw<C, S> {
    fn drop(&mut self) {
        /*
         * Notes about unsafety here:
         * * We are in a destructor and it takes &mut self, so there are no
         *   concurrent accesses and nothing in flight; in particular the
         *   root slot cannot hold a descriptor.
         * * Therefore using unprotected and Relaxed is fine ‒ everything
         *   was synchronized into this thread by whatever handed us the
         *   exclusive reference.
         * * Dropping the root INode cascades through the tree: each INode
         *   owns its main allocation, mains own their branch arrays, and
         *   branch arrays hold Arc'd children.
         */
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let root = self.root.load(Ordering::Relaxed, guard);
            assert!(
                !rf(root).contains(RootFlags::DESCRIPTOR),
                "Dropping a trie in the middle of a root swap"
            );
            drop(root.into_owned());
        }
    }
}
