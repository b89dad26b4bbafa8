//! # pagearena
//!
//! A page-backed arena allocator for workloads that allocate and free many
//! small, similarly sized blocks.
//!
//! ```text
//!   Arena
//!   ├── pages: [Page 0 (frozen)] [Page 1 (frozen)] [Page 2 (current)]
//!   └── free lists: class 0 (8 B) ─▶ blk ─▶ blk
//!                   class 1 (16 B) ─▶ blk
//!                   ...
//! ```
//!
//! Pages are mapped straight from the OS, one page at a time. Each page keeps
//! a directory of 32-bit slot-relative offsets recording where every block it
//! handed out begins and ends. Freed blocks are pushed on an intrusive LIFO
//! stack for their 8-byte size class and reused before any new bytes are
//! carved. Memory only goes back to the OS when the arena is destroyed.
//!
//! ```rust,no_run
//! use pagearena::Arena;
//!
//! let mut arena = Arena::new()?;
//! let block = arena.allocate(24)?;
//! // Safety: `block` came from this arena with size 24 and is not used again.
//! unsafe { arena.deallocate(block.as_ptr(), 24) };
//! assert_eq!(arena.allocate(24)?, block);
//! arena.destroy()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! An arena has exactly one owner. Use one arena per thread, or wrap a shared
//! one in a `Mutex`.

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// arena
pub use memory::arena::{Arena, ArenaConfig, ArenaError, ArenaStats};
pub use memory::free_list::ALIGNMENT;
pub use memory::page::ArenaLayout;

// stats
pub use memory::stats::MemoryStats;

// errors
pub use memory::vm::VmError;
