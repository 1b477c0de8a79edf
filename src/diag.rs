//! Consistency checks and dumps. None of these mutate the arena; they exist to
//! catch corruption in tests and debug builds, not to guard the fast path.

use thiserror::Error;

use crate::arena::RbtAllocator;
use crate::header::{ClaimedHeader, FREE_HEADER_SIZE, FreeHeader, clean};
use crate::list::BlockList;
use crate::tree::{is_red, parent_of};

// =============================================================================
// Violations
// =============================================================================

/// Structural problem found by [`RbtAllocator::audit`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
  #[error("a tree node is its own left child")]
  LeftChildLoop,

  #[error("a tree node is its own right child")]
  RightChildLoop,

  #[error("a left child does not point back to its parent")]
  LeftParentMismatch,

  #[error("a right child does not point back to its parent")]
  RightParentMismatch,

  #[error("a red node has a red child")]
  RedRed,

  #[error("black-height differs across paths (expected {expected}, found {found})")]
  BlackHeight { expected: usize, found: usize },

  #[error("the tree root is red")]
  RedRoot,

  #[error("the tree root has a parent")]
  RootHasParent,

  #[error("address-order list links are inconsistent")]
  ListBroken,

  #[error("two free blocks are adjacent at offset {offset}")]
  AdjacentFree { offset: usize },

  #[error("list has {list} free blocks but the tree holds {tree}")]
  ListTreeDesync { list: usize, tree: usize },

  #[error("used {used} + free {free} does not add up to total {total}")]
  CapacityMismatch { total: usize, used: usize, free: usize },
}

impl Violation {
  /// Stable numeric code, suitable for logs and exit statuses.
  pub fn code(&self) -> u32 {
    match self {
      Self::LeftChildLoop => 1,
      Self::RightChildLoop => 2,
      Self::LeftParentMismatch => 3,
      Self::RightParentMismatch => 4,
      Self::RedRed => 5,
      Self::BlackHeight { .. } => 6,
      Self::RedRoot => 7,
      Self::RootHasParent => 8,
      Self::ListBroken => 9,
      Self::AdjacentFree { .. } => 10,
      Self::ListTreeDesync { .. } => 11,
      Self::CapacityMismatch { .. } => 12,
    }
  }
}

// =============================================================================
// Tree traversal
// =============================================================================

/// In-order walk over the free tree using parent links, so it needs no
/// allocation. `budget` caps the number of steps in case links form a cycle.
pub(crate) struct TreeIter {
  next: *mut FreeHeader,
  budget: usize,
}

impl TreeIter {
  /// # Safety
  ///
  /// `root` must be null or the root of a tree of readable free headers.
  pub unsafe fn new(root: *mut FreeHeader, budget: usize) -> Self {
    Self {
      next: unsafe { leftmost(root) },
      budget,
    }
  }
}

unsafe fn leftmost(mut node: *mut FreeHeader) -> *mut FreeHeader {
  unsafe {
    while !node.is_null() && !(*node).left.is_null() && (*node).left != node {
      node = (*node).left;
    }
  }
  node
}

impl Iterator for TreeIter {
  type Item = *mut FreeHeader;

  fn next(&mut self) -> Option<Self::Item> {
    if self.next.is_null() || self.budget == 0 {
      return None;
    }
    self.budget -= 1;
    let current = self.next;

    // SAFETY: `new` requires every reachable node to be readable.
    unsafe {
      let right = (*current).right;
      self.next = if !right.is_null() && right != current {
        leftmost(right)
      } else {
        let mut child = current;
        let mut parent = parent_of(current);
        let mut climb = self.budget;
        while !parent.is_null() && (*parent).right == child && climb > 0 {
          child = parent;
          parent = parent_of(parent);
          climb -= 1;
        }
        parent
      };
    }

    Some(current)
  }
}

/// Pre-order descent through child links. Every child's parent link is
/// checked against the node it was reached from, so a broken back link is
/// reported before anything relies on it.
struct TreeAudit {
  budget: usize,
  count: usize,
  black_height: Option<usize>,
}

impl TreeAudit {
  /// `blacks` counts the black nodes strictly above `node`.
  unsafe fn visit(&mut self, node: *mut FreeHeader, blacks: usize) -> Result<(), Violation> {
    if node.is_null() {
      return match self.black_height {
        None => {
          self.black_height = Some(blacks);
          Ok(())
        }
        Some(expected) if expected != blacks => Err(Violation::BlackHeight {
          expected,
          found: blacks,
        }),
        Some(_) => Ok(()),
      };
    }
    if self.count == self.budget {
      // Node count is cross-checked by the caller.
      return Ok(());
    }
    self.count += 1;

    unsafe {
      let left = (*node).left;
      let right = (*node).right;

      if left == node {
        return Err(Violation::LeftChildLoop);
      }
      if right == node {
        return Err(Violation::RightChildLoop);
      }
      if !left.is_null() && parent_of(left) != node {
        return Err(Violation::LeftParentMismatch);
      }
      if !right.is_null() && parent_of(right) != node {
        return Err(Violation::RightParentMismatch);
      }
      if is_red(node) && (is_red(left) || is_red(right)) {
        return Err(Violation::RedRed);
      }

      let blacks = blacks + usize::from(!is_red(node));
      self.visit(left, blacks)?;
      self.visit(right, blacks)
    }
  }
}

/// Checks every red-black property of the tree rooted at `root` and returns
/// the number of nodes.
///
/// # Safety
///
/// All nodes reachable from `root` must be readable free headers.
pub(crate) unsafe fn audit_tree(root: *mut FreeHeader, max_nodes: usize) -> Result<usize, Violation> {
  if root.is_null() {
    return Ok(0);
  }
  unsafe {
    if is_red(root) {
      return Err(Violation::RedRoot);
    }
    if !parent_of(root).is_null() {
      return Err(Violation::RootHasParent);
    }
  }

  let mut audit = TreeAudit {
    budget: max_nodes,
    count: 0,
    black_height: None,
  };
  unsafe { audit.visit(root, 0) }?;
  Ok(audit.count)
}

// =============================================================================
// Block traversal
// =============================================================================

/// One block of the arena as seen by [`RbtAllocator::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Distance of the block header from the arena start.
  pub offset: usize,
  /// Block size, header included.
  pub size: usize,
  pub free: bool,
}

/// Address-order iterator over every block. See [`RbtAllocator::blocks`].
pub struct Blocks<'a> {
  allocator: &'a RbtAllocator,
  current: *mut ClaimedHeader,
  budget: usize,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let list = &self.allocator.list;
    if self.current == list.end || self.budget == 0 {
      return None;
    }
    self.budget -= 1;
    let block = self.current;

    // SAFETY: the allocator keeps every block between `first` and `end` linked.
    unsafe {
      self.current = clean((*block).next);
      Some(BlockInfo {
        offset: block.addr() - list.first.addr(),
        size: BlockList::size_of(block),
        free: list.is_free(block),
      })
    }
  }
}

// =============================================================================
// Allocator diagnostics
// =============================================================================

impl RbtAllocator {
  /// Upper bound on the number of blocks the arena can hold.
  fn max_blocks(&self) -> usize {
    self.total / FREE_HEADER_SIZE + 1
  }

  /// Walks every block in address order.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      allocator: self,
      current: self.list.first,
      budget: self.max_blocks(),
    }
  }

  /// Number of nodes in the free tree, counted by traversal.
  pub fn tree_node_count(&self) -> usize {
    unsafe { TreeIter::new(self.tree.root, self.max_blocks()) }.count()
  }

  /// Checks that every `next` link is mirrored by the following block's `prev`
  /// link and that the walk ends exactly at the arena end.
  pub fn check_list_integrity(&self) -> bool {
    let list = &self.list;
    let mut current = list.first;
    let mut budget = self.max_blocks();

    unsafe {
      if !clean((*current).prev).is_null() {
        return false;
      }
      while budget > 0 {
        budget -= 1;
        let next = clean((*current).next);
        if next == list.end {
          return true;
        }
        if next <= current || next > list.end {
          return false;
        }
        if clean((*next).prev) != current {
          return false;
        }
        current = next;
      }
    }

    false
  }

  /// Full audit: red-black properties, list links, free-block adjacency,
  /// list/tree agreement and capacity accounting.
  pub fn audit(&self) -> Result<(), Violation> {
    let nodes = unsafe { audit_tree(self.tree.root, self.max_blocks()) }?;

    if !self.check_list_integrity() {
      return Err(Violation::ListBroken);
    }

    let mut free_blocks = 0;
    let mut free_bytes = 0;
    let mut previous_free = false;
    for block in self.blocks() {
      if block.free {
        if previous_free {
          return Err(Violation::AdjacentFree { offset: block.offset });
        }
        free_blocks += 1;
        free_bytes += block.size;
      }
      previous_free = block.free;
    }

    let listed_in_tree = unsafe { TreeIter::new(self.tree.root, self.max_blocks()) }
      .all(|node| unsafe { self.list.is_free(FreeHeader::as_block(node)) });
    if free_blocks != nodes || nodes != self.tree.len() || !listed_in_tree {
      return Err(Violation::ListTreeDesync {
        list: free_blocks,
        tree: nodes,
      });
    }

    if self.used + free_bytes != self.total {
      return Err(Violation::CapacityMismatch {
        total: self.total,
        used: self.used,
        free: free_bytes,
      });
    }

    Ok(())
  }

  /// Panics on the first violation found. Compiled to nothing unless debug
  /// assertions or the `sanity-checks` feature are on.
  pub fn check_sanity(&self) {
    #[cfg(any(debug_assertions, feature = "sanity-checks"))]
    {
      if let Err(violation) = self.audit() {
        panic!("allocator corrupted: {violation} (code {})", violation.code());
      }
    }
  }

  /// Logs every block's size and state at `debug` level, in address order.
  pub fn dump_blocks(&self) {
    log::debug!("blocks dump ({} free in tree):", self.tree.len());
    for block in self.blocks() {
      let state = if block.free { "free" } else { "claimed" };
      log::debug!("  +{:#x} {state} {} bytes", block.offset, block.size);
    }
  }
}
