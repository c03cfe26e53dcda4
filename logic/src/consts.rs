/// Identifier width in bytes (160 bit key space, as in the Kademlia paper).
pub const ID_LEN: usize = 20;

pub const ID_LEN_BITS: usize = ID_LEN * 8;
