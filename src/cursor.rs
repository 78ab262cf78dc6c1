use crate::array::{HugeArray, Result};
use crate::layout::ROOT;
use crate::value::{StoredValue, ValueTag};

//-------------------------------------------------------------------------

// Manual bit-by-bit traversal.  Mutations never move or free nodes, so
// the cursor stays valid across them; clear resets it to the new root.
impl<V: StoredValue> HugeArray<V> {
    pub fn seek_reset(&mut self) {
        self.cursor_node = ROOT;
        self.cursor_stack.clear();
    }

    // Descends to the child selected by `bit`.  Returns false, staying
    // put, when there is no such child.
    pub fn seek_to_next(&mut self, bit: bool) -> Result<bool> {
        let child = self.read_node(self.cursor_node)?.child(bit);
        if child == 0 {
            return Ok(false);
        }

        self.cursor_stack.push(self.cursor_node);
        self.cursor_node = child as u64;
        Ok(true)
    }

    // Climbs back to the parent.  Returns false at the root.
    pub fn seek_back(&mut self) -> bool {
        match self.cursor_stack.pop() {
            Some(node) => {
                self.cursor_node = node;
                true
            }
            None => false,
        }
    }

    pub fn current_offset(&self) -> u64 {
        self.cursor_node
    }

    pub fn current_value_info(&mut self) -> Result<(ValueTag, u32)> {
        let rec = self.read_node(self.cursor_node)?;
        Ok((rec.tag, rec.value_ptr))
    }

    pub fn current_value(&mut self) -> Result<Option<V>> {
        let rec = self.read_node(self.cursor_node)?;
        self.value_of(&rec)
    }
}

//-------------------------------------------------------------------------
