//! Red-black tree of free blocks, keyed by block size.
//!
//! The tree is intrusive: a node is the [`FreeHeader`] at the start of the free
//! block itself, so a node's identity is its address and it can never move.
//! Every restructuring below is done by relinking, never by copying payload.
//!
//! Color lives in bit 1 of each node's `parent` link (set = red). A null child
//! counts as black.

use core::ptr::null_mut;

use crate::fit::{Fit, try_fit};
use crate::header::{FreeHeader, clean, link_is_red, red_link};
use crate::list::BlockList;

// =============================================================================
// Node accessors
// =============================================================================

#[inline(always)]
unsafe fn size_of(node: *mut FreeHeader) -> usize {
  unsafe { BlockList::size_of(FreeHeader::as_block(node)) }
}

#[inline(always)]
pub(crate) unsafe fn parent_of(node: *mut FreeHeader) -> *mut FreeHeader {
  unsafe { clean((*node).parent) }
}

/// Null nodes are black.
#[inline(always)]
pub(crate) unsafe fn is_red(node: *mut FreeHeader) -> bool {
  !node.is_null() && unsafe { link_is_red((*node).parent) }
}

#[inline(always)]
unsafe fn set_red(node: *mut FreeHeader, red: bool) {
  unsafe { (*node).parent = red_link((*node).parent, red) };
}

/// Points `node` at a new parent, keeping its color.
#[inline(always)]
unsafe fn set_parent(node: *mut FreeHeader, parent: *mut FreeHeader) {
  unsafe { (*node).parent = red_link(parent, link_is_red((*node).parent)) };
}

// =============================================================================
// Tree
// =============================================================================

pub(crate) struct FreeTree {
  pub root: *mut FreeHeader,
  len: usize,
}

impl FreeTree {
  pub const fn new() -> Self {
    Self {
      root: null_mut(),
      len: 0,
    }
  }

  /// Number of free blocks in the tree.
  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  /// Makes `new` take the place of `old` under `parent` (or as root).
  #[inline]
  unsafe fn replace_child(&mut self, parent: *mut FreeHeader, old: *mut FreeHeader, new: *mut FreeHeader) {
    if parent.is_null() {
      self.root = new;
    } else if unsafe { (*parent).left } == old {
      unsafe { (*parent).left = new };
    } else {
      unsafe { (*parent).right = new };
    }
  }

  /// ```text
  ///     x                y
  ///    / \              / \
  ///   a   y     =>     x   c
  ///      / \          / \
  ///     b   c        a   b
  /// ```
  unsafe fn rotate_left(&mut self, x: *mut FreeHeader) {
    unsafe {
      let y = (*x).right;
      let parent = parent_of(x);

      (*x).right = (*y).left;
      if !(*y).left.is_null() {
        set_parent((*y).left, x);
      }

      set_parent(y, parent);
      self.replace_child(parent, x, y);

      (*y).left = x;
      set_parent(x, y);
    }
  }

  /// Mirror of [`Self::rotate_left`].
  unsafe fn rotate_right(&mut self, x: *mut FreeHeader) {
    unsafe {
      let y = (*x).left;
      let parent = parent_of(x);

      (*x).left = (*y).right;
      if !(*y).right.is_null() {
        set_parent((*y).right, x);
      }

      set_parent(y, parent);
      self.replace_child(parent, x, y);

      (*y).right = x;
      set_parent(x, y);
    }
  }

  // ===========================================================================
  // Insert
  // ===========================================================================

  /// Inserts a free block. Smaller sizes go left, equal or larger go right, so
  /// equal sizes keep insertion order.
  ///
  /// # Safety
  ///
  /// `node` must be a linked free block that is not in the tree, with room
  /// for a full [`FreeHeader`].
  pub unsafe fn insert(&mut self, node: *mut FreeHeader) {
    unsafe {
      FreeHeader::reset_links(node);
      let size = size_of(node);

      let mut parent = null_mut();
      let mut go_left = false;
      let mut cursor = self.root;
      while !cursor.is_null() {
        parent = cursor;
        go_left = size < size_of(cursor);
        cursor = if go_left { (*cursor).left } else { (*cursor).right };
      }

      (*node).parent = red_link(parent, true);
      if parent.is_null() {
        self.root = node;
      } else if go_left {
        (*parent).left = node;
      } else {
        (*parent).right = node;
      }

      self.insert_fixup(node);
    }
    self.len += 1;
  }

  /// Walks up from a fresh red leaf, resolving red-red pairs.
  unsafe fn insert_fixup(&mut self, mut node: *mut FreeHeader) {
    unsafe {
      loop {
        let mut parent = parent_of(node);
        if !is_red(parent) {
          break;
        }
        // A red parent is never the root, so the grandparent exists.
        let grandparent = parent_of(parent);

        if parent == (*grandparent).left {
          let uncle = (*grandparent).right;
          if is_red(uncle) {
            set_red(parent, false);
            set_red(uncle, false);
            set_red(grandparent, true);
            node = grandparent;
            continue;
          }
          if node == (*parent).right {
            // Inner grandchild: turn it into an outer one first.
            self.rotate_left(parent);
            node = parent;
            parent = parent_of(node);
          }
          set_red(parent, false);
          set_red(grandparent, true);
          self.rotate_right(grandparent);
        } else {
          let uncle = (*grandparent).left;
          if is_red(uncle) {
            set_red(parent, false);
            set_red(uncle, false);
            set_red(grandparent, true);
            node = grandparent;
            continue;
          }
          if node == (*parent).left {
            self.rotate_right(parent);
            node = parent;
            parent = parent_of(node);
          }
          set_red(parent, false);
          set_red(grandparent, true);
          self.rotate_left(grandparent);
        }
        break;
      }

      set_red(self.root, false);
    }
  }

  // ===========================================================================
  // Remove
  // ===========================================================================

  /// Removes a free block from the tree. Its tree links are left cleared.
  ///
  /// # Safety
  ///
  /// `node` must currently be in this tree.
  pub unsafe fn remove(&mut self, node: *mut FreeHeader) {
    unsafe {
      if !(*node).left.is_null() && !(*node).right.is_null() {
        let mut successor = (*node).right;
        while !(*successor).left.is_null() {
          successor = (*successor).left;
        }
        // Afterwards `node` sits where its successor was: no left child.
        self.swap_with_successor(node, successor);
      }

      let child = if (*node).left.is_null() { (*node).right } else { (*node).left };
      let parent = parent_of(node);
      let removed_red = is_red(node);

      self.replace_child(parent, node, child);
      if !child.is_null() {
        set_parent(child, parent);
      }

      if removed_red {
        // Removing a red node never changes a black-height.
      } else if is_red(child) {
        set_red(child, false);
      } else {
        self.remove_fixup(child, parent);
      }

      FreeHeader::reset_links(node);
    }
    self.len -= 1;
  }

  /// Exchanges the tree positions (and colors) of `node` and its in-order
  /// successor. Only links change; both blocks stay where they are in memory.
  unsafe fn swap_with_successor(&mut self, node: *mut FreeHeader, successor: *mut FreeHeader) {
    unsafe {
      let node_parent = parent_of(node);
      let node_red = is_red(node);
      let node_left = (*node).left;
      let node_right = (*node).right;
      let successor_red = is_red(successor);
      let successor_right = (*successor).right;
      // Read before `successor.parent` is overwritten below.
      let successor_parent = parent_of(successor);

      self.replace_child(node_parent, node, successor);
      (*successor).parent = red_link(node_parent, node_red);
      (*successor).left = node_left;
      set_parent(node_left, successor);

      if node_right == successor {
        (*successor).right = node;
        (*node).parent = red_link(successor, successor_red);
      } else {
        (*successor).right = node_right;
        set_parent(node_right, successor);
        // A leftmost descendant is always a left child.
        (*successor_parent).left = node;
        (*node).parent = red_link(successor_parent, successor_red);
      }

      (*node).left = null_mut();
      (*node).right = successor_right;
      if !successor_right.is_null() {
        set_parent(successor_right, node);
      }
    }
  }

  /// Resolves a missing black on the path through `node` (possibly null),
  /// whose parent is `parent`.
  unsafe fn remove_fixup(&mut self, mut node: *mut FreeHeader, mut parent: *mut FreeHeader) {
    unsafe {
      while node != self.root && !is_red(node) {
        if node == (*parent).left {
          // The deficient side is left, so the sibling exists.
          let mut sibling = (*parent).right;
          if is_red(sibling) {
            set_red(sibling, false);
            set_red(parent, true);
            self.rotate_left(parent);
            sibling = (*parent).right;
          }

          if !is_red((*sibling).left) && !is_red((*sibling).right) {
            set_red(sibling, true);
            if is_red(parent) {
              set_red(parent, false);
              return;
            }
            node = parent;
            parent = parent_of(node);
            continue;
          }

          if !is_red((*sibling).right) {
            // Right-left: bring the red nephew to the outside.
            set_red((*sibling).left, false);
            set_red(sibling, true);
            self.rotate_right(sibling);
            sibling = (*parent).right;
          }
          set_red(sibling, is_red(parent));
          set_red(parent, false);
          set_red((*sibling).right, false);
          self.rotate_left(parent);
        } else {
          let mut sibling = (*parent).left;
          if is_red(sibling) {
            set_red(sibling, false);
            set_red(parent, true);
            self.rotate_right(parent);
            sibling = (*parent).left;
          }

          if !is_red((*sibling).left) && !is_red((*sibling).right) {
            set_red(sibling, true);
            if is_red(parent) {
              set_red(parent, false);
              return;
            }
            node = parent;
            parent = parent_of(node);
            continue;
          }

          if !is_red((*sibling).left) {
            set_red((*sibling).right, false);
            set_red(sibling, true);
            self.rotate_left(sibling);
            sibling = (*parent).left;
          }
          set_red(sibling, is_red(parent));
          set_red(parent, false);
          set_red((*sibling).left, false);
          self.rotate_right(parent);
        }
        node = self.root;
      }

      if !node.is_null() {
        set_red(node, false);
      }
    }
  }

  // ===========================================================================
  // Search
  // ===========================================================================

  /// Approximate best fit. Checks the root, then walks down preferring a
  /// fitting left child, then a fitting right child, else moving right. The
  /// last fitting node visited wins, which is not always the smallest one.
  ///
  /// # Safety
  ///
  /// All nodes must be linked free blocks. `align` must be a power of two.
  pub unsafe fn find_fit(&self, size: usize, align: usize) -> Option<(*mut FreeHeader, Fit)> {
    unsafe {
      let mut chosen = try_fit(self.root, size, align).map(|fit| (self.root, fit));

      let mut node = self.root;
      while !node.is_null() && (!(*node).left.is_null() || !(*node).right.is_null()) {
        let left = (*node).left;
        let right = (*node).right;

        if let Some(fit) = try_fit(left, size, align) {
          chosen = Some((left, fit));
          node = left;
        } else if let Some(fit) = try_fit(right, size, align) {
          chosen = Some((right, fit));
          node = right;
        } else {
          node = right;
        }
      }

      chosen
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::diag::{Violation, audit_tree};
  use crate::header::{ClaimedHeader, MIN_ALIGN, free_link};

  /// Backing buffer carved into blocks of the given sizes, each linked into
  /// one address-order list. The first block is a claimed spacer so every
  /// test block has a predecessor.
  #[derive(Clone, Copy)]
  #[repr(C, align(16))]
  struct Chunk([u8; 16]);

  struct Carved {
    _buffer: Vec<Chunk>,
    blocks: Vec<*mut FreeHeader>,
  }

  fn carve(sizes: &[usize]) -> Carved {
    const SPACER: usize = 64;
    let total: usize = SPACER + sizes.iter().sum::<usize>();
    let mut buffer = vec![Chunk([0; 16]); total / 16 + 1];
    let base = buffer.as_mut_ptr().cast::<u8>();
    assert_eq!(base.addr() % MIN_ALIGN, 0);

    let mut starts = vec![base];
    let mut offset = SPACER;
    for size in sizes {
      starts.push(base.wrapping_add(offset));
      offset += size;
    }
    starts.push(base.wrapping_add(offset));

    let headers: Vec<*mut ClaimedHeader> = starts.iter().map(|p| p.cast()).collect();
    unsafe {
      for i in 0..headers.len() - 1 {
        let header = headers[i];
        let prev = if i == 0 { null_mut() } else { headers[i - 1] };
        (*header).prev = free_link(prev, i > 1);
        (*header).next = free_link(headers[i + 1], false);
      }
    }

    Carved {
      _buffer: buffer,
      blocks: headers[1..headers.len() - 1].iter().map(|h| h.cast()).collect(),
    }
  }

  fn sizes_in_order(tree: &FreeTree) -> Vec<usize> {
    fn walk(node: *mut FreeHeader, out: &mut Vec<usize>) {
      if node.is_null() {
        return;
      }
      unsafe {
        walk((*node).left, out);
        out.push(size_of(node));
        walk((*node).right, out);
      }
    }
    let mut out = Vec::new();
    walk(tree.root, &mut out);
    out
  }

  #[test]
  fn ascending_inserts_stay_balanced() {
    let sizes: Vec<usize> = (1..=64).map(|i| 48 + i * MIN_ALIGN).collect();
    let carved = carve(&sizes);
    let mut tree = FreeTree::new();

    for &block in &carved.blocks {
      unsafe { tree.insert(block) };
      assert_eq!(unsafe { audit_tree(tree.root, 1 << 20) }, Ok(tree.len()));
    }

    assert_eq!(sizes_in_order(&tree), sizes);
    assert!(unsafe { !is_red(tree.root) });
  }

  #[test]
  fn duplicates_are_kept() {
    let carved = carve(&[64; 20]);
    let mut tree = FreeTree::new();
    for &block in &carved.blocks {
      unsafe { tree.insert(block) };
    }
    assert_eq!(tree.len(), 20);
    assert_eq!(sizes_in_order(&tree), vec![64; 20]);
    assert_eq!(unsafe { audit_tree(tree.root, 1 << 20) }, Ok(20));
  }

  #[test]
  fn removal_in_every_position() {
    let sizes: Vec<usize> = [7, 3, 11, 1, 5, 9, 13, 2, 4, 6, 8, 10, 12, 14, 15, 3, 9]
      .iter()
      .map(|k| 48 + k * MIN_ALIGN)
      .collect();
    let carved = carve(&sizes);

    // Remove in several orders: root-first, leaves-first, interleaved.
    let orders: [Vec<usize>; 3] = [
      (0..sizes.len()).collect(),
      (0..sizes.len()).rev().collect(),
      (0..sizes.len()).map(|i| (i * 7) % sizes.len()).collect(),
    ];

    for order in orders {
      let mut tree = FreeTree::new();
      for &block in &carved.blocks {
        unsafe { tree.insert(block) };
      }

      let mut expected: Vec<usize> = sizes.clone();
      expected.sort();

      for index in order {
        let block = carved.blocks[index];
        unsafe { tree.remove(block) };
        let size = unsafe { size_of(block) };
        let at = expected.iter().position(|&s| s == size).unwrap();
        expected.remove(at);

        assert_eq!(unsafe { audit_tree(tree.root, 1 << 20) }, Ok(tree.len()));
        assert_eq!(sizes_in_order(&tree), expected);
        unsafe {
          assert!((*block).left.is_null() && (*block).right.is_null() && (*block).parent.is_null());
        }
      }
      assert!(tree.root.is_null());
    }
  }

  #[test]
  fn removing_the_root_with_two_children() {
    let carved = carve(&[96, 64, 128]);
    let mut tree = FreeTree::new();
    for &block in &carved.blocks {
      unsafe { tree.insert(block) };
    }
    assert_eq!(tree.root, carved.blocks[0]);

    unsafe { tree.remove(carved.blocks[0]) };
    assert_eq!(tree.root, carved.blocks[2]);
    assert_eq!(unsafe { (*tree.root).left }, carved.blocks[1]);
    assert_eq!(unsafe { audit_tree(tree.root, 1 << 20) }, Ok(2));
  }

  #[test]
  fn removing_the_root_with_a_deep_successor() {
    //       100
    //      /   \
    //    50     200
    //          /
    //        150
    let sizes: Vec<usize> = [100, 50, 200, 150].iter().map(|k| 48 + k * MIN_ALIGN).collect();
    let carved = carve(&sizes);
    let mut tree = FreeTree::new();
    for &block in &carved.blocks {
      unsafe { tree.insert(block) };
    }
    unsafe {
      assert_eq!(tree.root, carved.blocks[0]);
      assert_eq!((*(*tree.root).right).left, carved.blocks[3]);

      tree.remove(carved.blocks[0]);

      assert_eq!(tree.root, carved.blocks[3]);
      assert!(parent_of(tree.root).is_null());
      assert_eq!((*tree.root).left, carved.blocks[1]);
      assert_eq!((*tree.root).right, carved.blocks[2]);
      assert_eq!(parent_of(carved.blocks[2]), carved.blocks[3]);
      assert!((*carved.blocks[2]).left.is_null());
      assert_eq!(audit_tree(tree.root, 1 << 20), Ok(3));
    }

    let mut expected = sizes[1..].to_vec();
    expected.sort();
    assert_eq!(sizes_in_order(&tree), expected);
  }

  #[test]
  fn removing_an_inner_node_with_a_deep_successor() {
    // Level order of a perfect tree over 1..=31, so most inner nodes have a
    // right child with a left subtree.
    let mut keys: Vec<usize> = (1..=31).collect();
    keys.sort_by_key(|k| core::cmp::Reverse(k.trailing_zeros()));
    let sizes: Vec<usize> = keys.iter().map(|k| 48 + k * MIN_ALIGN).collect();
    let carved = carve(&sizes);
    let mut tree = FreeTree::new();
    for &block in &carved.blocks {
      unsafe { tree.insert(block) };
    }

    // Every node whose successor is not its right child.
    let deep: Vec<*mut FreeHeader> = carved
      .blocks
      .iter()
      .copied()
      .filter(|&node| unsafe {
        let right = (*node).right;
        !(*node).left.is_null() && !right.is_null() && !(*right).left.is_null()
      })
      .collect();
    assert!(deep.len() > 2);

    let mut expected = sizes.clone();
    expected.sort();
    for node in deep {
      unsafe {
        if (*node).left.is_null() || (*node).right.is_null() {
          continue;
        }
        let size = size_of(node);
        tree.remove(node);
        expected.remove(expected.iter().position(|&s| s == size).unwrap());
        assert_eq!(audit_tree(tree.root, 1 << 20), Ok(tree.len()));
      }
      assert_eq!(sizes_in_order(&tree), expected);
    }
  }

  #[test]
  fn audit_catches_a_red_root() {
    let carved = carve(&[64]);
    let mut tree = FreeTree::new();
    unsafe {
      tree.insert(carved.blocks[0]);
      set_red(tree.root, true);
      assert_eq!(audit_tree(tree.root, 1 << 20), Err(Violation::RedRoot));
    }
  }

  #[test]
  fn find_fit_prefers_left_then_right() {
    let carved = carve(&[128, 64, 256]);
    let mut tree = FreeTree::new();
    for &block in &carved.blocks {
      unsafe { tree.insert(block) };
    }

    unsafe {
      // Root (128) fits, left (64) fits too and is taken.
      let (block, fit) = tree.find_fit(32, 16).unwrap();
      assert_eq!(block, carved.blocks[1]);
      assert_eq!(fit.used, 32);

      // Left is too small, right (256) fits and is the last one accepted.
      let (block, _) = tree.find_fit(100, 16).unwrap();
      assert_eq!(block, carved.blocks[2]);

      assert!(tree.find_fit(1024, 16).is_none());
    }
  }
}
