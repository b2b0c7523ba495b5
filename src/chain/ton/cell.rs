//! TVM cells and bag-of-cells serialization
//!
//! Only ordinary (level 0) cells are produced, which is all that wallet
//! messages and HTLC registry calls need.

use super::address::TonAddress;
use crate::error::{SwapError, SwapResult};
use crate::secret::sha256;

use std::collections::HashMap;
use std::sync::Arc;

pub const MAX_BITS: usize = 1023;
pub const MAX_REFS: usize = 4;

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl Cell {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            bit_len: 0,
            refs: Vec::new(),
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.refs
    }

    pub fn depth(&self) -> u16 {
        self.refs
            .iter()
            .map(|r| r.depth() + 1)
            .max()
            .unwrap_or(0)
    }

    fn descriptors(&self) -> [u8; 2] {
        let d1 = self.refs.len() as u8;
        let d2 = (self.bit_len / 8 + (self.bit_len + 7) / 8) as u8;
        [d1, d2]
    }

    /// Data rounded up to whole bytes with the completion tag appended
    fn padded_data(&self) -> Vec<u8> {
        let mut data = self.data[..(self.bit_len + 7) / 8].to_vec();
        let rem = self.bit_len % 8;
        if rem != 0 {
            if let Some(last) = data.last_mut() {
                *last |= 0x80 >> rem;
            }
        }
        data
    }

    /// Representation hash
    pub fn hash(&self) -> [u8; 32] {
        let mut repr = Vec::with_capacity(2 + 128 + self.refs.len() * 34);
        repr.extend_from_slice(&self.descriptors());
        repr.extend(self.padded_data());
        for r in &self.refs {
            repr.extend_from_slice(&r.depth().to_be_bytes());
        }
        for r in &self.refs {
            repr.extend_from_slice(&r.hash());
        }
        sha256(&repr)
    }
}

#[derive(Debug, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_bit(&mut self, bit: bool) -> SwapResult<&mut Self> {
        if self.bit_len >= MAX_BITS {
            return Err(SwapError::Internal("Cell overflow".to_string()));
        }
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            let idx = self.bit_len / 8;
            self.data[idx] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
        Ok(self)
    }

    /// Store the low `bits` bits of `value`, most significant first
    pub fn store_uint(&mut self, value: u128, bits: usize) -> SwapResult<&mut Self> {
        if bits > 128 || (bits < 128 && value >> bits != 0) {
            return Err(SwapError::Internal(format!(
                "Value {} does not fit in {} bits",
                value, bits
            )));
        }
        for i in (0..bits).rev() {
            self.store_bit((value >> i) & 1 == 1)?;
        }
        Ok(self)
    }

    pub fn store_int(&mut self, value: i8, bits: usize) -> SwapResult<&mut Self> {
        let unsigned = (value as i128 as u128) & ((1u128 << bits) - 1);
        self.store_uint(unsigned, bits)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> SwapResult<&mut Self> {
        for byte in bytes {
            self.store_uint(*byte as u128, 8)?;
        }
        Ok(self)
    }

    /// `VarUInteger 16`: byte length in 4 bits, then the value
    pub fn store_coins(&mut self, amount: u128) -> SwapResult<&mut Self> {
        if amount == 0 {
            return self.store_uint(0, 4);
        }
        let len = (128 - amount.leading_zeros() as usize + 7) / 8;
        if len > 15 {
            return Err(SwapError::Internal(format!("Coins {} out of range", amount)));
        }
        self.store_uint(len as u128, 4)?;
        self.store_uint(amount, len * 8)
    }

    /// `addr_std$10 anycast:0 workchain_id:int8 address:bits256`
    pub fn store_address(&mut self, address: &TonAddress) -> SwapResult<&mut Self> {
        self.store_uint(0b10, 2)?;
        self.store_bit(false)?;
        self.store_int(address.workchain, 8)?;
        self.store_bytes(&address.hash)
    }

    /// `addr_none$00`
    pub fn store_address_none(&mut self) -> SwapResult<&mut Self> {
        self.store_uint(0, 2)
    }

    pub fn store_ref(&mut self, cell: Arc<Cell>) -> SwapResult<&mut Self> {
        if self.refs.len() >= MAX_REFS {
            return Err(SwapError::Internal("Too many cell references".to_string()));
        }
        self.refs.push(cell);
        Ok(self)
    }

    pub fn build(&mut self) -> Arc<Cell> {
        Arc::new(Cell {
            data: std::mem::take(&mut self.data),
            bit_len: std::mem::replace(&mut self.bit_len, 0),
            refs: std::mem::take(&mut self.refs),
        })
    }
}

fn byte_width(value: usize) -> usize {
    let mut width = 1;
    while width < 8 && value >> (8 * width) != 0 {
        width += 1;
    }
    width
}

fn push_sized(out: &mut Vec<u8>, value: usize, width: usize) {
    let bytes = (value as u64).to_be_bytes();
    out.extend_from_slice(&bytes[8 - width..]);
}

/// Parents before children, each distinct cell once
fn topological_order(root: &Arc<Cell>) -> Vec<Arc<Cell>> {
    fn visit(
        cell: &Arc<Cell>,
        seen: &mut HashMap<[u8; 32], ()>,
        post: &mut Vec<Arc<Cell>>,
    ) {
        if seen.insert(cell.hash(), ()).is_some() {
            return;
        }
        for r in cell.refs() {
            visit(r, seen, post);
        }
        post.push(cell.clone());
    }

    let mut seen = HashMap::new();
    let mut post = Vec::new();
    visit(root, &mut seen, &mut post);
    post.reverse();
    post
}

/// Serialize a single-root bag of cells without index or checksum
pub fn to_boc(root: &Arc<Cell>) -> Vec<u8> {
    let cells = topological_order(root);
    let index: HashMap<[u8; 32], usize> = cells
        .iter()
        .enumerate()
        .map(|(i, c)| (c.hash(), i))
        .collect();

    let size_bytes = byte_width(cells.len());

    let mut body = Vec::new();
    for cell in &cells {
        body.extend_from_slice(&cell.descriptors());
        body.extend(cell.padded_data());
        for r in cell.refs() {
            push_sized(&mut body, index[&r.hash()], size_bytes);
        }
    }
    let off_bytes = byte_width(body.len());

    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&BOC_MAGIC);
    out.push(size_bytes as u8);
    out.push(off_bytes as u8);
    push_sized(&mut out, cells.len(), size_bytes);
    push_sized(&mut out, 1, size_bytes);
    push_sized(&mut out, 0, size_bytes);
    push_sized(&mut out, body.len(), off_bytes);
    push_sized(&mut out, 0, size_bytes);
    out.extend(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cell_hash() {
        assert_eq!(
            hex::encode(Cell::empty().hash()),
            "96a296d224f285c67bee93c30f8a309157f0daa35dc5b87e410b78630a09cfc7"
        );
    }

    #[test]
    fn test_empty_cell_boc() {
        let boc = to_boc(&Arc::new(Cell::empty()));
        assert_eq!(hex::encode(boc), "b5ee9c72010101010002000000");
    }

    #[test]
    fn test_completion_tag_padding() {
        let cell = CellBuilder::new().store_bit(true).unwrap().build();
        assert_eq!(cell.descriptors(), [0, 1]);
        assert_eq!(cell.padded_data(), vec![0b1100_0000]);

        let cell = CellBuilder::new().store_uint(0xab, 8).unwrap().build();
        assert_eq!(cell.descriptors(), [0, 2]);
        assert_eq!(cell.padded_data(), vec![0xab]);
    }

    #[test]
    fn test_coins_encoding() {
        let cell = CellBuilder::new().store_coins(0).unwrap().build();
        assert_eq!(cell.bit_len(), 4);

        // 1 TON = 0x3b9aca00, four bytes
        let cell = CellBuilder::new().store_coins(1_000_000_000).unwrap().build();
        assert_eq!(cell.bit_len(), 4 + 32);
        assert_eq!(cell.padded_data(), vec![0x43, 0xb9, 0xac, 0xa0, 0x08]);
    }

    #[test]
    fn test_overflow_rejected() {
        let mut builder = CellBuilder::new();
        for _ in 0..MAX_BITS {
            builder.store_bit(false).unwrap();
        }
        assert!(builder.store_bit(true).is_err());
        assert!(CellBuilder::new().store_uint(256, 8).is_err());
    }

    #[test]
    fn test_depth_and_shared_refs() {
        let leaf = CellBuilder::new().store_uint(1, 8).unwrap().build();
        let mid = CellBuilder::new().store_ref(leaf.clone()).unwrap().build();
        let root = CellBuilder::new()
            .store_ref(mid)
            .unwrap()
            .store_ref(leaf)
            .unwrap()
            .build();
        assert_eq!(root.depth(), 2);

        let order = topological_order(&root);
        assert_eq!(order.len(), 3);
        let pos = |c: &Arc<Cell>| order.iter().position(|o| o.hash() == c.hash()).unwrap();
        for cell in &order {
            for r in cell.refs() {
                assert!(pos(r) > pos(cell));
            }
        }
    }
}
