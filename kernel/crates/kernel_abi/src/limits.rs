/// Maximum number of instructions the kernel accepts in one classic BPF filter.
pub const BPF_MAXINSNS: usize = 4096;

/// Number of 32-bit scratch memory words available to a classic BPF filter.
pub const BPF_MEMWORDS: usize = 16;
