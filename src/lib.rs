use core::{
  mem::size_of,
  ops::Range,
  ptr::{NonNull, null_mut},
};
use std::cell::{Cell, RefCell};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

// =============================================================================
// Constants
// =============================================================================

const PAGE_SIZE_BITS: u32 = 16;
/// Arena growth unit.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS; // 64KB
/// Largest arena in pages. Every byte offset stays representable as `u32`.
pub const MAX_PAGES: u32 = 0xFFFF;

/// Arena offset of the runtime type table (start of the static data segment).
pub const RTTI_BASE: u32 = 16;
/// Static data segment: type count, then `(flags, base)` pairs per type id.
const STATIC_DATA: [u8; 21] = [
  0x03, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
  0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10,
];
/// End of static data. Pointers at or below it are immortal singletons.
pub const HEAP_BASE: u32 = 44;

const AL_BITS: u32 = 4;
const AL_SIZE: u32 = 1 << AL_BITS; // 16
const AL_MASK: u32 = AL_SIZE - 1;

/// Header bytes in front of every payload.
pub const BLOCK_OVERHEAD: u32 = 16;
/// Smallest payload capacity; a free block must hold both list links.
pub const BLOCK_MINSIZE: u32 = 16;
/// Exclusive upper bound on payload capacity.
pub const BLOCK_MAXSIZE: u32 = 0x3FFF_FFF0;
/// Largest payload a single block can carry.
const BLOCK_MAXFIT: u32 = BLOCK_MAXSIZE - AL_SIZE;

/// Minor classes per major class.
const SL_BITS: u32 = 4;
const SL_COUNT: usize = 1 << SL_BITS;
/// Sizes below `SB_SIZE` map linearly into major class 0.
const SB_BITS: u32 = SL_BITS + AL_BITS;
const SB_SIZE: u32 = 1 << SB_BITS; // 256
/// Number of major classes.
const FL_COUNT: usize = 23;
/// Searches round requests up to the next minor class below this size.
const ROUNDING_LIMIT: u32 = (1 << 29) - 8;

// Block info word (header bytes 0..4).
const FREE: u32 = 1 << 0;
const LEFT_FREE: u32 = 1 << 1;
const TAGS_MASK: u32 = FREE | LEFT_FREE;

// GC info word (header bytes 4..8).
const RC_MASK: u32 = 0x0FFF_FFFF;
const BUFFERED: u32 = 1 << 31;

// Header field offsets.
const GC_INFO: u32 = 4;
const RT_ID: u32 = 8;
const RT_SIZE: u32 = 12;
const NEXT_FREE: u32 = 16;
const PREV_FREE: u32 = 20;

// Free-list root layout, relative to `ROOT`.
const ROOT: u32 = align_up(HEAP_BASE, AL_SIZE);
const SL_START: u32 = 4;
const HL_START: u32 = SL_START + FL_COUNT as u32 * 4;
const HL_END: u32 = HL_START + (FL_COUNT * SL_COUNT) as u32 * 4;
const ROOT_SIZE: u32 = HL_END + 4; // + tail sentinel slot
/// First managed block.
const HEAP_START: u32 = align_up(ROOT + ROOT_SIZE, AL_SIZE);

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ROOT == 48);
const _: () = assert!(HL_START == 96);
const _: () = assert!(ROOT_SIZE == 1572);
const _: () = assert!(HEAP_START == 1632);
const _: () = assert!(HEAP_BASE >= RTTI_BASE + STATIC_DATA.len() as u32);
const _: () = assert!(FL_COUNT <= 32);
const _: () = assert!(SL_COUNT <= 32);
const _: () = assert!((31 - BLOCK_MAXSIZE.leading_zeros()) - (SB_BITS - 1) + 1 == FL_COUNT as u32);
const _: () = assert!(BLOCK_MAXSIZE & AL_MASK == 0);
const _: () = assert!((MAX_PAGES as u64) << PAGE_SIZE_BITS <= u32::MAX as u64);
const _: () = assert!(HEAP_START as usize + 3 * BLOCK_OVERHEAD as usize <= PAGE_SIZE);

// =============================================================================
// Errors
// =============================================================================

/// Fatal allocator conditions.
///
/// Nothing inside the heap recovers from a trap; the host decides what the
/// user sees (the process runtime below aborts).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Trap {
  #[error("out-of-bounds access of {len} bytes at {offset:#x} (arena is {arena_len} bytes)")]
  OutOfBounds {
    offset: u32,
    len: usize,
    arena_len: usize,
  },
  #[error("out of memory: arena cannot grow to fit {requested} bytes")]
  OutOfMemory { requested: u32 },
  #[error("allocation size {requested} exceeds the maximum block size")]
  InvalidSize { requested: u32 },
  #[error("{ptr:#x} is not an object pointer")]
  InvalidPointer { ptr: u32 },
  #[error("corrupt block header at {block:#x} (size {size})")]
  CorruptHeader { block: u32, size: u32 },
  #[error("block {block:#x} should be free")]
  NotFree { block: u32 },
  #[error("use after free of block {block:#x}")]
  UseAfterFree { block: u32 },
  #[error("unknown type id {type_id} on block {block:#x}")]
  UnknownType { block: u32, type_id: u32 },
  #[error("reference count overflow on block {block:#x}")]
  RefcountOverflow { block: u32 },
  #[error("reference count underflow on block {block:#x}")]
  RefcountUnderflow { block: u32 },
  #[error("block {block:#x} released while buffered")]
  BufferedRelease { block: u32 },
  #[error("free-list corruption at {block:#x}: {reason}")]
  CorruptFreeList { block: u32, reason: &'static str },
  #[error("allocator re-entered while an operation is in progress")]
  Reentrancy,
}

/// Coarse grouping of [`Trap`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
  ResourceExhaustion,
  InvalidSize,
  Corruption,
  Reentrancy,
}

impl Trap {
  /// Stable reason code handed to the host's trap handler.
  pub const fn code(&self) -> u32 {
    match self {
      Self::OutOfBounds { .. } => 1,
      Self::OutOfMemory { .. } => 2,
      Self::InvalidSize { .. } => 3,
      Self::InvalidPointer { .. } => 4,
      Self::CorruptHeader { .. } => 5,
      Self::NotFree { .. } => 6,
      Self::UseAfterFree { .. } => 7,
      Self::UnknownType { .. } => 8,
      Self::RefcountOverflow { .. } => 9,
      Self::RefcountUnderflow { .. } => 10,
      Self::BufferedRelease { .. } => 11,
      Self::CorruptFreeList { .. } => 12,
      Self::Reentrancy => 13,
    }
  }

  pub const fn kind(&self) -> TrapKind {
    match self {
      Self::OutOfMemory { .. } => TrapKind::ResourceExhaustion,
      Self::InvalidSize { .. } => TrapKind::InvalidSize,
      Self::Reentrancy => TrapKind::Reentrancy,
      _ => TrapKind::Corruption,
    }
  }
}

// =============================================================================
// Configuration
// =============================================================================

/// Heap construction parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Pages the arena holds before the first allocation. At least 1.
  pub initial_pages: u32,
  /// Grow by at least the current page count (doubling), falling back to the
  /// exact shortfall when the host refuses.
  pub eager_growth: bool,
}

impl HeapConfig {
  pub const DEFAULT_INITIAL_PAGES: u32 = 1;
  pub const DEFAULT_EAGER_GROWTH: bool = true;

  pub fn new() -> Self {
    Self {
      initial_pages: Self::DEFAULT_INITIAL_PAGES,
      eager_growth: Self::DEFAULT_EAGER_GROWTH,
    }
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Host-provided backing store for the arena.
///
/// `data` always spans whole pages. Growth only ever appends zeroed pages.
pub trait Memory {
  fn data(&self) -> &[u8];
  fn data_mut(&mut self) -> &mut [u8];
  /// Appends `delta` pages. Returns the previous page count, or `None` if the
  /// store cannot be extended.
  fn grow(&mut self, delta: u32) -> Option<u32>;

  fn pages(&self) -> u32 {
    (self.data().len() / PAGE_SIZE) as u32
  }
}

/// Arena backed by a `Vec<u8>`.
#[derive(Debug, Default)]
pub struct VecMemory {
  data: Vec<u8>,
  max_pages: u32,
}

impl VecMemory {
  pub fn new(max_pages: u32) -> Self {
    Self {
      data: Vec::new(),
      max_pages: max_pages.min(MAX_PAGES),
    }
  }
}

impl Memory for VecMemory {
  fn data(&self) -> &[u8] {
    &self.data
  }

  fn data_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  fn grow(&mut self, delta: u32) -> Option<u32> {
    let old = self.pages();
    let new = old.checked_add(delta).filter(|&n| n <= self.max_pages)?;
    self.data.resize(new as usize * PAGE_SIZE, 0);
    Some(old)
  }
}

/// Arena backed by one `mmap` reservation of `max_pages`; growth only moves
/// the committed length, so the base address never changes.
#[cfg(unix)]
pub struct MmapMemory {
  base: NonNull<u8>,
  pages: u32,
  max_pages: u32,
}

#[cfg(unix)]
impl MmapMemory {
  pub fn new(max_pages: u32) -> Option<Self> {
    let max_pages = max_pages.clamp(1, MAX_PAGES);
    let raw = unsafe { os_mmap(max_pages as usize * PAGE_SIZE) };
    NonNull::new(raw).map(|base| Self {
      base,
      pages: 0,
      max_pages,
    })
  }
}

#[cfg(unix)]
impl Memory for MmapMemory {
  fn data(&self) -> &[u8] {
    unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.pages as usize * PAGE_SIZE) }
  }

  fn data_mut(&mut self) -> &mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.pages as usize * PAGE_SIZE) }
  }

  fn grow(&mut self, delta: u32) -> Option<u32> {
    let old = self.pages;
    self.pages = old.checked_add(delta).filter(|&n| n <= self.max_pages)?;
    Some(old)
  }

  fn pages(&self) -> u32 {
    self.pages
  }
}

#[cfg(unix)]
impl Drop for MmapMemory {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.max_pages as usize * PAGE_SIZE) };
  }
}

// =============================================================================
// Arena
// =============================================================================

/// Fixed-width little-endian value stored in the arena.
pub trait Scalar: Copy {
  const SIZE: usize;
  fn load(bytes: &[u8]) -> Self;
  fn store(self, bytes: &mut [u8]);
}

macro_rules! impl_scalar {
  ($($ty:ty),*) => {
    $(
      impl Scalar for $ty {
        const SIZE: usize = size_of::<$ty>();

        #[inline(always)]
        fn load(bytes: &[u8]) -> Self {
          let mut raw = [0u8; size_of::<$ty>()];
          raw.copy_from_slice(bytes);
          <$ty>::from_le_bytes(raw)
        }

        #[inline(always)]
        fn store(self, bytes: &mut [u8]) {
          bytes.copy_from_slice(&self.to_le_bytes());
        }
      }
    )*
  };
}

impl_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Bounds-checked view over the host memory.
pub struct Arena<M> {
  memory: M,
}

impl<M: Memory> Arena<M> {
  fn new(memory: M) -> Self {
    Self { memory }
  }

  pub fn len(&self) -> usize {
    self.memory.data().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn pages(&self) -> u32 {
    self.memory.pages()
  }

  pub fn memory(&self) -> &M {
    &self.memory
  }

  #[inline]
  fn range(&self, offset: u32, len: usize) -> Result<Range<usize>, Trap> {
    let start = offset as usize;
    match start.checked_add(len) {
      Some(end) if end <= self.len() => Ok(start..end),
      _ => Err(Trap::OutOfBounds {
        offset,
        len,
        arena_len: self.len(),
      }),
    }
  }

  #[inline]
  pub fn read<T: Scalar>(&self, offset: u32) -> Result<T, Trap> {
    let range = self.range(offset, T::SIZE)?;
    Ok(T::load(&self.memory.data()[range]))
  }

  #[inline]
  pub fn write<T: Scalar>(&mut self, offset: u32, value: T) -> Result<(), Trap> {
    let range = self.range(offset, T::SIZE)?;
    value.store(&mut self.memory.data_mut()[range]);
    Ok(())
  }

  pub fn bytes(&self, offset: u32, len: u32) -> Result<&[u8], Trap> {
    let range = self.range(offset, len as usize)?;
    Ok(&self.memory.data()[range])
  }

  pub fn bytes_mut(&mut self, offset: u32, len: u32) -> Result<&mut [u8], Trap> {
    let range = self.range(offset, len as usize)?;
    Ok(&mut self.memory.data_mut()[range])
  }

  /// Appends `delta` pages, returning the old page count. Never exceeds
  /// [`MAX_PAGES`].
  pub fn grow(&mut self, delta: u32) -> Option<u32> {
    if self.pages().checked_add(delta)? > MAX_PAGES {
      return None;
    }
    self.memory.grow(delta)
  }

  pub fn as_mut_ptr(&mut self) -> *mut u8 {
    self.memory.data_mut().as_mut_ptr()
  }
}

// =============================================================================
// Size Classes
// =============================================================================

/// Two-level segregated-fit class. Ordered by `(major, minor)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass {
  pub major: u8,
  pub minor: u8,
}

impl SizeClass {
  /// Class a free block of capacity `size` is filed under.
  pub const fn of(size: u32) -> Self {
    if size < SB_SIZE {
      Self {
        major: 0,
        minor: (size >> AL_BITS) as u8,
      }
    } else {
      let msb = 31 - size.leading_zeros();
      Self {
        major: (msb - (SB_BITS - 1)) as u8,
        minor: ((size >> (msb - SL_BITS)) ^ (1 << SL_BITS)) as u8,
      }
    }
  }

  /// First class whose every block can hold `size` (a multiple of 16).
  pub const fn search(size: u32) -> Self {
    Self::of(round_to_class(size))
  }

  /// Smallest capacity filed under this class.
  pub const fn min_size(self) -> u32 {
    if self.major == 0 {
      (self.minor as u32) << AL_BITS
    } else {
      ((1 << SL_BITS) | self.minor as u32) << (self.major as u32 + SB_BITS - SL_BITS - 1)
    }
  }

  const fn head_slot(self) -> u32 {
    ROOT + HL_START + (((self.major as u32) << SL_BITS) + self.minor as u32) * 4
  }
}

/// Rounds `size` up by one minor-class width (minus one), so that the floor
/// mapping of the result never lands in a class that may hold smaller blocks.
const fn round_to_class(size: u32) -> u32 {
  if size >= SB_SIZE && size < ROUNDING_LIMIT {
    size + (1 << (27 - size.leading_zeros())) - 1
  } else {
    size
  }
}

/// Block capacity for a user request: 16-aligned, at least [`BLOCK_MINSIZE`].
pub const fn adjusted_size(requested: u32) -> Result<u32, Trap> {
  if requested >= BLOCK_MAXSIZE {
    return Err(Trap::InvalidSize { requested });
  }
  let size = align_up(requested, AL_SIZE);
  Ok(if size > BLOCK_MINSIZE { size } else { BLOCK_MINSIZE })
}

// =============================================================================
// Blocks
// =============================================================================

/// Size-and-flags word at the start of every block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct BlockInfo(u32);

impl BlockInfo {
  pub const fn new(size: u32) -> Self {
    Self(size & !TAGS_MASK)
  }

  pub const fn size(self) -> u32 {
    self.0 & !TAGS_MASK
  }

  pub const fn is_free(self) -> bool {
    self.0 & FREE != 0
  }

  /// The physically preceding block is free.
  pub const fn is_left_free(self) -> bool {
    self.0 & LEFT_FREE != 0
  }

  pub const fn with_size(self, size: u32) -> Self {
    Self((size & !TAGS_MASK) | (self.0 & TAGS_MASK))
  }

  pub const fn with_free(self, free: bool) -> Self {
    if free { Self(self.0 | FREE) } else { Self(self.0 & !FREE) }
  }

  pub const fn with_left_free(self, left_free: bool) -> Self {
    if left_free {
      Self(self.0 | LEFT_FREE)
    } else {
      Self(self.0 & !LEFT_FREE)
    }
  }
}

/// Reference count (low 28 bits) plus collector flags (high 4 bits).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
struct GcInfo(u32);

impl GcInfo {
  const fn count(self) -> u32 {
    self.0 & RC_MASK
  }

  const fn is_buffered(self) -> bool {
    self.0 & BUFFERED != 0
  }

  const fn with_count(self, count: u32) -> Self {
    Self((count & RC_MASK) | (self.0 & !RC_MASK))
  }

  /// `None` once the count field is saturated.
  const fn incremented(self) -> Option<Self> {
    if self.count() == RC_MASK {
      None
    } else {
      Some(self.with_count(self.count() + 1))
    }
  }
}

/// Arena offset of a block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(u32);

impl Block {
  pub const fn offset(self) -> u32 {
    self.0
  }

  pub const fn payload(self) -> u32 {
    self.0 + BLOCK_OVERHEAD
  }

  const fn field(self, offset: u32) -> u32 {
    self.0 + offset
  }

  /// Decodes a free-list link; 0 means no link.
  fn link(raw: u32) -> Option<Self> {
    (raw != 0).then_some(Self(raw))
  }

  fn raw_link(link: Option<Self>) -> u32 {
    link.map_or(0, |block| block.0)
  }
}

/// Runtime type ids the finalizer understands.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
  /// Opaque bytes.
  Buffer = 0,
  /// Opaque UTF-16 string data.
  String = 1,
  /// One object pointer at payload offset 0.
  Boxed = 2,
}

impl ObjectKind {
  pub const fn from_id(id: u32) -> Option<Self> {
    match id {
      0 => Some(Self::Buffer),
      1 => Some(Self::String),
      2 => Some(Self::Boxed),
      _ => None,
    }
  }

  pub const fn id(self) -> u32 {
    self as u32
  }
}

/// Pointers into the static data region are never counted.
#[inline(always)]
pub const fn is_immortal(ptr: u32) -> bool {
  ptr <= HEAP_BASE
}

/// One physical block as seen by [`Heap::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockView {
  pub offset: u32,
  pub payload: u32,
  pub size: u32,
  pub free: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub pages: u32,
  pub live_blocks: usize,
  pub live_bytes: u64,
  pub free_blocks: usize,
  pub free_bytes: u64,
  pub largest_free: u32,
}

/// Payload for the next block carved out of `avail` fresh bytes. Whatever is
/// left after it must be zero or enough for another minimum block.
const fn chunk_size(avail: u32) -> u32 {
  if avail <= BLOCK_MAXFIT {
    return avail;
  }
  let rest = avail - BLOCK_MAXFIT;
  if rest < BLOCK_OVERHEAD + BLOCK_MINSIZE {
    BLOCK_MAXFIT - (BLOCK_OVERHEAD + BLOCK_MINSIZE - rest)
  } else {
    BLOCK_MAXFIT
  }
}

#[inline]
fn checked_size(block: Block, info: BlockInfo) -> Result<u32, Trap> {
  let size = info.size();
  if (BLOCK_MINSIZE..BLOCK_MAXSIZE).contains(&size) && size & AL_MASK == 0 {
    Ok(size)
  } else {
    Err(Trap::CorruptHeader {
      block: block.0,
      size,
    })
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Reference-counted TLSF heap owning its arena and free-list root.
pub struct Heap<M: Memory> {
  arena: Arena<M>,
  config: HeapConfig,
}

impl<M: Memory> Heap<M> {
  pub fn new(memory: M) -> Result<Self, Trap> {
    Self::with_config(memory, HeapConfig::default())
  }

  /// Lays out the static data and the free-list root, then hands everything
  /// past the root to the free lists as one block.
  pub fn with_config(memory: M, config: HeapConfig) -> Result<Self, Trap> {
    let mut arena = Arena::new(memory);
    let initial = config.initial_pages.max(1);
    let pages = arena.pages();
    if pages < initial && arena.grow(initial - pages).is_none() {
      return Err(Trap::OutOfMemory {
        requested: initial.saturating_mul(PAGE_SIZE as u32),
      });
    }

    arena
      .bytes_mut(RTTI_BASE, STATIC_DATA.len() as u32)?
      .copy_from_slice(&STATIC_DATA);
    arena.bytes_mut(ROOT, ROOT_SIZE)?.fill(0);

    let mut heap = Self { arena, config };
    let end = heap.arena.len() as u32;
    heap.add_memory(HEAP_START, end)?;

    debug!(pages = heap.arena.pages(), "heap initialized");
    Ok(heap)
  }

  pub fn arena(&self) -> &Arena<M> {
    &self.arena
  }

  pub fn arena_mut(&mut self) -> &mut Arena<M> {
    &mut self.arena
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub const fn rtti_base(&self) -> u32 {
    RTTI_BASE
  }

  // ---------------------------------------------------------------------------
  // Root
  // ---------------------------------------------------------------------------

  fn fl_map(&self) -> Result<u32, Trap> {
    self.arena.read(ROOT)
  }

  fn set_fl_map(&mut self, map: u32) -> Result<(), Trap> {
    self.arena.write(ROOT, map)
  }

  fn sl_map(&self, major: u8) -> Result<u32, Trap> {
    self.arena.read(ROOT + SL_START + ((major as u32) << 2))
  }

  fn set_sl_map(&mut self, major: u8, map: u32) -> Result<(), Trap> {
    self.arena.write(ROOT + SL_START + ((major as u32) << 2), map)
  }

  fn head(&self, class: SizeClass) -> Result<Option<Block>, Trap> {
    self.arena.read::<u32>(class.head_slot()).map(Block::link)
  }

  fn set_head(&mut self, class: SizeClass, head: Option<Block>) -> Result<(), Trap> {
    self.arena.write(class.head_slot(), Block::raw_link(head))
  }

  fn tail(&self) -> Result<Option<Block>, Trap> {
    self.arena.read::<u32>(ROOT + HL_END).map(Block::link)
  }

  fn set_tail(&mut self, tail: Block) -> Result<(), Trap> {
    self.arena.write(ROOT + HL_END, tail.0)
  }

  // ---------------------------------------------------------------------------
  // Headers and neighbors
  // ---------------------------------------------------------------------------

  fn info(&self, block: Block) -> Result<BlockInfo, Trap> {
    self.arena.read(block.0).map(BlockInfo)
  }

  fn set_info(&mut self, block: Block, info: BlockInfo) -> Result<(), Trap> {
    self.arena.write(block.0, info.0)
  }

  fn gc_info(&self, block: Block) -> Result<GcInfo, Trap> {
    self.arena.read(block.field(GC_INFO)).map(GcInfo)
  }

  fn set_gc_info(&mut self, block: Block, gc: GcInfo) -> Result<(), Trap> {
    self.arena.write(block.field(GC_INFO), gc.0)
  }

  fn next_free(&self, block: Block) -> Result<Option<Block>, Trap> {
    self.arena.read::<u32>(block.field(NEXT_FREE)).map(Block::link)
  }

  fn set_next_free(&mut self, block: Block, next: Option<Block>) -> Result<(), Trap> {
    self.arena.write(block.field(NEXT_FREE), Block::raw_link(next))
  }

  fn prev_free(&self, block: Block) -> Result<Option<Block>, Trap> {
    self.arena.read::<u32>(block.field(PREV_FREE)).map(Block::link)
  }

  fn set_prev_free(&mut self, block: Block, prev: Option<Block>) -> Result<(), Trap> {
    self.arena.write(block.field(PREV_FREE), Block::raw_link(prev))
  }

  /// Physically next block (possibly the tail sentinel).
  fn right_of(&self, block: Block, info: BlockInfo) -> Result<Block, Trap> {
    block
      .0
      .checked_add(BLOCK_OVERHEAD + info.size())
      .filter(|&right| right as usize + BLOCK_OVERHEAD as usize <= self.arena.len())
      .map(Block)
      .ok_or(Trap::CorruptHeader {
        block: block.0,
        size: info.size(),
      })
  }

  /// Physically preceding block, when `info` says it is free. Found through
  /// the back-pointer the free block keeps in its last word.
  fn free_left_of(&self, block: Block, info: BlockInfo) -> Result<Option<Block>, Trap> {
    if !info.is_left_free() {
      return Ok(None);
    }
    let left = Block(self.arena.read(block.0 - 4)?);
    if left.0 < HEAP_START || !self.info(left)?.is_free() {
      return Err(Trap::NotFree { block: left.0 });
    }
    Ok(Some(left))
  }

  /// Resolves a payload pointer to its header.
  fn block_of(&self, ptr: u32) -> Result<Block, Trap> {
    if ptr < HEAP_START + BLOCK_OVERHEAD || ptr & AL_MASK != 0 {
      return Err(Trap::InvalidPointer { ptr });
    }
    Ok(Block(ptr - BLOCK_OVERHEAD))
  }

  /// Like `block_of`, but the block must be allocated.
  fn live_block(&self, ptr: u32) -> Result<Block, Trap> {
    let block = self.block_of(ptr)?;
    if self.info(block)?.is_free() {
      return Err(Trap::UseAfterFree { block: block.0 });
    }
    Ok(block)
  }

  // ---------------------------------------------------------------------------
  // Bitmap index
  // ---------------------------------------------------------------------------

  fn mark_non_empty(&mut self, class: SizeClass) -> Result<(), Trap> {
    let fl_map = self.fl_map()?;
    self.set_fl_map(fl_map | 1 << class.major)?;
    let sl_map = self.sl_map(class.major)?;
    self.set_sl_map(class.major, sl_map | 1 << class.minor)
  }

  fn mark_empty(&mut self, class: SizeClass) -> Result<(), Trap> {
    let sl_map = self.sl_map(class.major)? & !(1 << class.minor);
    self.set_sl_map(class.major, sl_map)?;
    if sl_map == 0 {
      let fl_map = self.fl_map()?;
      self.set_fl_map(fl_map & !(1 << class.major))?;
    }
    Ok(())
  }

  /// Smallest non-empty class at or above `class`.
  fn find_first_fit(&self, class: SizeClass) -> Result<Option<SizeClass>, Trap> {
    let sl_map = self.sl_map(class.major)? & (u32::MAX << class.minor);
    if sl_map != 0 {
      return Ok(Some(SizeClass {
        major: class.major,
        minor: sl_map.trailing_zeros() as u8,
      }));
    }

    let fl_map = self.fl_map()? & (u32::MAX << (class.major + 1));
    if fl_map == 0 {
      return Ok(None);
    }
    let major = fl_map.trailing_zeros() as u8;
    let sl_map = self.sl_map(major)?;
    if sl_map == 0 {
      return Err(Trap::CorruptFreeList {
        block: ROOT,
        reason: "major class marked non-empty with an empty minor bitmap",
      });
    }
    Ok(Some(SizeClass {
      major,
      minor: sl_map.trailing_zeros() as u8,
    }))
  }

  // ---------------------------------------------------------------------------
  // Free lists
  // ---------------------------------------------------------------------------

  /// Files a `FREE` block, merging it with free physical neighbors first.
  fn insert_block(&mut self, mut block: Block) -> Result<(), Trap> {
    let mut info = self.info(block)?;
    if !info.is_free() {
      return Err(Trap::NotFree { block: block.0 });
    }
    checked_size(block, info)?;

    let mut right = self.right_of(block, info)?;
    let mut right_info = self.info(right)?;
    if right_info.is_free() {
      let merged = info.size() + BLOCK_OVERHEAD + right_info.size();
      if merged < BLOCK_MAXSIZE {
        self.remove_block(right)?;
        info = info.with_size(merged);
        self.set_info(block, info)?;
        right = self.right_of(block, info)?;
        right_info = self.info(right)?;
        trace!(block = block.0, size = merged, "coalesced right");
      }
    }

    if let Some(left) = self.free_left_of(block, info)? {
      let left_info = self.info(left)?;
      let merged = left_info.size() + BLOCK_OVERHEAD + info.size();
      if merged < BLOCK_MAXSIZE {
        self.remove_block(left)?;
        info = left_info.with_size(merged);
        self.set_info(left, info)?;
        block = left;
        trace!(block = block.0, size = merged, "coalesced left");
      }
    }

    self.set_info(right, right_info.with_left_free(true))?;
    let size = checked_size(block, info)?;
    if block.0 + BLOCK_OVERHEAD + size != right.0 {
      return Err(Trap::CorruptFreeList {
        block: block.0,
        reason: "block does not end at its right neighbor",
      });
    }
    self.arena.write(right.0 - 4, block.0)?;

    let class = SizeClass::of(size);
    let head = self.head(class)?;
    self.set_prev_free(block, None)?;
    self.set_next_free(block, head)?;
    if let Some(head) = head {
      self.set_prev_free(head, Some(block))?;
    }
    self.set_head(class, Some(block))?;
    self.mark_non_empty(class)
  }

  /// Unlinks a free block from its list and clears `FREE`.
  fn remove_block(&mut self, block: Block) -> Result<(), Trap> {
    let info = self.info(block)?;
    if !info.is_free() {
      return Err(Trap::NotFree { block: block.0 });
    }
    let class = SizeClass::of(checked_size(block, info)?);

    let prev = self.prev_free(block)?;
    let next = self.next_free(block)?;
    if let Some(next) = next {
      self.set_prev_free(next, prev)?;
    }
    if let Some(prev) = prev {
      self.set_next_free(prev, next)?;
    }

    if self.head(class)? == Some(block) {
      self.set_head(class, next)?;
      if next.is_none() {
        self.mark_empty(class)?;
      }
    }
    self.set_info(block, info.with_free(false))
  }

  // ---------------------------------------------------------------------------
  // Block allocator
  // ---------------------------------------------------------------------------

  /// Head of the first sufficient non-empty class.
  fn find_block(&self, size: u32) -> Result<Option<Block>, Trap> {
    let Some(class) = self.find_first_fit(SizeClass::search(size))? else {
      return Ok(None);
    };
    let head = self.head(class)?.ok_or(Trap::CorruptFreeList {
      block: class.head_slot(),
      reason: "class marked non-empty has no list head",
    })?;
    // Only requests above the rounding limit can land on a short block.
    if self.info(head)?.size() < size {
      return Ok(None);
    }
    Ok(Some(head))
  }

  /// Trims an unlinked block to `size`, returning any usable tail to the
  /// free lists.
  fn split_block(&mut self, block: Block, size: u32) -> Result<(), Trap> {
    let info = self.info(block)?;
    let remaining = info.size().checked_sub(size).ok_or(Trap::CorruptHeader {
      block: block.0,
      size: info.size(),
    })?;

    if remaining >= BLOCK_OVERHEAD + BLOCK_MINSIZE {
      self.set_info(block, info.with_size(size).with_free(false))?;
      let spare = Block(block.0 + BLOCK_OVERHEAD + size);
      self.set_info(spare, BlockInfo::new(remaining - BLOCK_OVERHEAD).with_free(true))?;
      self.insert_block(spare)
    } else {
      self.set_info(block, info.with_free(false))?;
      let right = self.right_of(block, info)?;
      let right_info = self.info(right)?;
      self.set_info(right, right_info.with_left_free(false))
    }
  }

  /// Adds `[start, end)` to the free lists and moves the tail sentinel to
  /// `end`. A region directly after the old tail reuses the tail's header.
  /// Regions too large for one block are carved into maximal blocks.
  fn add_memory(&mut self, start: u32, end: u32) -> Result<(), Trap> {
    let mut start = start;
    let mut tail_info = BlockInfo(0);
    if let Some(tail) = self.tail()? {
      if start < tail.0 + BLOCK_OVERHEAD {
        return Err(Trap::CorruptFreeList {
          block: tail.0,
          reason: "memory added below the tail sentinel",
        });
      }
      if tail.0 == start - BLOCK_OVERHEAD {
        start = tail.0;
        tail_info = self.info(tail)?;
      }
    }

    if end.saturating_sub(start) < 2 * BLOCK_OVERHEAD + BLOCK_MINSIZE {
      trace!(start, end, "region too small to hold a block");
      return Ok(());
    }

    let tail = Block(end - BLOCK_OVERHEAD);
    self.set_info(tail, BlockInfo::new(0))?;
    self.set_tail(tail)?;

    let mut block = Block(start);
    let mut left_free = tail_info.is_left_free();
    while block != tail {
      let size = chunk_size(tail.0 - block.0 - BLOCK_OVERHEAD);
      let right = Block(block.0 + BLOCK_OVERHEAD + size);
      if right != tail {
        self.set_info(right, BlockInfo::new(0))?;
      }
      self.set_info(
        block,
        BlockInfo::new(size)
          .with_free(true)
          .with_left_free(left_free),
      )?;
      self.set_prev_free(block, None)?;
      self.set_next_free(block, None)?;
      self.insert_block(block)?;

      left_free = true;
      block = right;
    }
    Ok(())
  }

  /// Extends the arena far enough for a `size` block to be found afterwards.
  fn grow_memory(&mut self, size: u32) -> Result<(), Trap> {
    let pages_before = self.arena.pages();
    let end = self.arena.len() as u32;
    let tail_at_end = self.tail()? == Some(Block(end - BLOCK_OVERHEAD));
    let overhead = if tail_at_end {
      BLOCK_OVERHEAD
    } else {
      2 * BLOCK_OVERHEAD
    };

    let request = u64::from(round_to_class(size)) + u64::from(overhead);
    let pages_needed = request.div_ceil(PAGE_SIZE as u64) as u32;
    let pages_wanted = if self.config.eager_growth {
      pages_before.max(pages_needed)
    } else {
      pages_needed
    };

    if self.arena.grow(pages_wanted).is_none() {
      if pages_wanted == pages_needed || self.arena.grow(pages_needed).is_none() {
        debug!(size, pages_before, pages_needed, "arena growth refused");
        return Err(Trap::OutOfMemory { requested: size });
      }
      warn!(pages_wanted, pages_needed, "eager growth refused, grew by the shortfall");
    }

    debug!(pages_before, pages_after = self.arena.pages(), "arena grown");
    let new_end = self.arena.len() as u32;
    self.add_memory(end, new_end)
  }

  /// Allocates a block with capacity for `size` bytes, tagged `type_id`, and
  /// returns its payload pointer. The reference count starts at zero.
  pub fn alloc(&mut self, size: u32, type_id: u32) -> Result<u32, Trap> {
    let adjusted = adjusted_size(size)?;
    let block = match self.find_block(adjusted)? {
      Some(block) => block,
      None => {
        self.grow_memory(adjusted)?;
        self
          .find_block(adjusted)?
          .ok_or(Trap::OutOfMemory { requested: size })?
      }
    };

    self.remove_block(block)?;
    self.split_block(block, adjusted)?;
    self.set_gc_info(block, GcInfo(0))?;
    self.arena.write(block.field(RT_ID), type_id)?;
    self.arena.write(block.field(RT_SIZE), size)?;

    trace!(ptr = block.payload(), size, type_id, "alloc");
    self.tripwire()?;
    Ok(block.payload())
  }

  // ---------------------------------------------------------------------------
  // Reference counting
  // ---------------------------------------------------------------------------

  pub fn retain(&mut self, ptr: u32) -> Result<u32, Trap> {
    if is_immortal(ptr) {
      return Ok(ptr);
    }
    let block = self.live_block(ptr)?;
    let gc = self
      .gc_info(block)?
      .incremented()
      .ok_or(Trap::RefcountOverflow { block: block.0 })?;
    self.set_gc_info(block, gc)?;
    Ok(ptr)
  }

  /// Drops one reference. At zero the object is finalized and its block
  /// returned to the free lists; nested references are released first.
  pub fn release(&mut self, ptr: u32) -> Result<(), Trap> {
    if is_immortal(ptr) {
      return Ok(());
    }

    // Chains of boxed objects are unwound iteratively; blocks are freed
    // innermost first, the same order recursive finalization would give.
    let mut dead = Vec::new();
    let mut pending = Some(ptr);
    while let Some(ptr) = pending.take() {
      let block = self.block_of(ptr)?;
      if self.decrement(block)? {
        pending = self.finalize(block)?;
        dead.push(block);
      }
    }
    for block in dead.into_iter().rev() {
      self.free_block(block)?;
    }

    self.tripwire()
  }

  /// Returns `true` when the count reached zero.
  fn decrement(&mut self, block: Block) -> Result<bool, Trap> {
    if self.info(block)?.is_free() {
      return Err(Trap::UseAfterFree { block: block.0 });
    }
    let gc = self.gc_info(block)?;
    match gc.count() {
      0 => Err(Trap::RefcountUnderflow { block: block.0 }),
      1 => {
        if gc.is_buffered() {
          return Err(Trap::BufferedRelease { block: block.0 });
        }
        self.set_gc_info(block, gc.with_count(0))?;
        Ok(true)
      }
      count => {
        self.set_gc_info(block, gc.with_count(count - 1))?;
        Ok(false)
      }
    }
  }

  fn free_block(&mut self, block: Block) -> Result<(), Trap> {
    let info = self.info(block)?;
    self.set_info(block, info.with_free(true))?;
    trace!(ptr = block.payload(), size = info.size(), "free");
    self.insert_block(block)
  }

  /// Reserved for a cycle collector. Reference counting reclaims everything
  /// acyclic, so there is nothing to do yet.
  pub fn collect(&mut self) {
    trace!("collect");
  }

  // ---------------------------------------------------------------------------
  // Finalizer dispatch
  // ---------------------------------------------------------------------------

  /// Returns the nested object pointer that must be released next, if any.
  fn finalize(&mut self, block: Block) -> Result<Option<u32>, Trap> {
    let type_id: u32 = self.arena.read(block.field(RT_ID))?;
    let kind = ObjectKind::from_id(type_id).ok_or(Trap::UnknownType {
      block: block.0,
      type_id,
    })?;
    match kind {
      ObjectKind::Buffer | ObjectKind::String => Ok(None),
      ObjectKind::Boxed => {
        let inner: u32 = self.arena.read(block.payload())?;
        Ok((inner != 0 && !is_immortal(inner)).then_some(inner))
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Object accessors
  // ---------------------------------------------------------------------------

  pub fn refcount(&self, ptr: u32) -> Result<u32, Trap> {
    let block = self.live_block(ptr)?;
    Ok(self.gc_info(block)?.count())
  }

  pub fn type_id(&self, ptr: u32) -> Result<u32, Trap> {
    let block = self.live_block(ptr)?;
    self.arena.read(block.field(RT_ID))
  }

  /// Size originally requested from [`Heap::alloc`].
  pub fn payload_size(&self, ptr: u32) -> Result<u32, Trap> {
    let block = self.live_block(ptr)?;
    self.arena.read(block.field(RT_SIZE))
  }

  /// Usable bytes behind `ptr`; at least the requested size.
  pub fn capacity(&self, ptr: u32) -> Result<u32, Trap> {
    let block = self.live_block(ptr)?;
    Ok(self.info(block)?.size())
  }

  // ---------------------------------------------------------------------------
  // Inspection
  // ---------------------------------------------------------------------------

  /// Walks physical blocks from the start of the heap to the tail sentinel.
  pub fn blocks(&self) -> Blocks<'_, M> {
    let tail = self.tail().ok().flatten();
    Blocks {
      heap: self,
      cursor: tail.map(|_| Block(HEAP_START)),
      tail,
    }
  }

  pub fn stats(&self) -> Result<HeapStats, Trap> {
    let mut stats = HeapStats {
      pages: self.arena.pages(),
      ..HeapStats::default()
    };
    for view in self.blocks() {
      let view = view?;
      if view.free {
        stats.free_blocks += 1;
        stats.free_bytes += u64::from(view.size);
        stats.largest_free = stats.largest_free.max(view.size);
      } else {
        stats.live_blocks += 1;
        stats.live_bytes += u64::from(view.size);
      }
    }
    Ok(stats)
  }

  /// Cross-checks physical layout, boundary tags, free lists and bitmaps.
  pub fn verify(&self) -> Result<(), Trap> {
    let corrupt = |block: Block, reason| Trap::CorruptFreeList {
      block: block.0,
      reason,
    };
    let tail = self
      .tail()?
      .ok_or(corrupt(Block(ROOT), "missing tail sentinel"))?;

    let mut free_in_heap = 0usize;
    let mut left_free = false;
    let mut left_size = 0u32;
    let mut block = Block(HEAP_START);
    while block != tail {
      if block > tail {
        return Err(corrupt(block, "block walk overran the tail sentinel"));
      }
      let info = self.info(block)?;
      let size = checked_size(block, info)?;
      if info.is_left_free() != left_free {
        return Err(corrupt(block, "LEFT_FREE disagrees with the left neighbor"));
      }
      let right = self.right_of(block, info)?;
      if info.is_free() {
        // Neighbors stay apart only when the merge would reach the size cap.
        if left_free && left_size + BLOCK_OVERHEAD + size < BLOCK_MAXSIZE {
          return Err(corrupt(block, "adjacent free blocks were not merged"));
        }
        if self.arena.read::<u32>(right.0 - 4)? != block.0 {
          return Err(corrupt(block, "stale back-pointer"));
        }
        free_in_heap += 1;
      }
      left_free = info.is_free();
      left_size = size;
      block = right;
    }

    let tail_info = self.info(tail)?;
    if tail_info.size() != 0 || tail_info.is_free() {
      return Err(Trap::CorruptHeader {
        block: tail.0,
        size: tail_info.size(),
      });
    }
    if tail_info.is_left_free() != left_free {
      return Err(corrupt(tail, "LEFT_FREE disagrees with the left neighbor"));
    }

    let mut free_in_lists = 0usize;
    let fl_map = self.fl_map()?;
    for major in 0..FL_COUNT as u8 {
      let sl_map = self.sl_map(major)?;
      if (fl_map >> major & 1 == 1) != (sl_map != 0) {
        return Err(corrupt(Block(ROOT), "major bitmap disagrees with minor bitmap"));
      }
      for minor in 0..SL_COUNT as u8 {
        let class = SizeClass { major, minor };
        let head = self.head(class)?;
        if (sl_map >> minor & 1 == 1) != head.is_some() {
          return Err(corrupt(Block(class.head_slot()), "minor bitmap disagrees with list"));
        }

        let mut prev = None;
        let mut cursor = head;
        while let Some(block) = cursor {
          let info = self.info(block)?;
          if !info.is_free() {
            return Err(Trap::NotFree { block: block.0 });
          }
          if SizeClass::of(checked_size(block, info)?) != class {
            return Err(corrupt(block, "block filed under the wrong class"));
          }
          if self.prev_free(block)? != prev {
            return Err(corrupt(block, "broken prev link"));
          }
          free_in_lists += 1;
          if free_in_lists > free_in_heap {
            return Err(corrupt(block, "free list holds a block the heap walk did not see"));
          }
          prev = Some(block);
          cursor = self.next_free(block)?;
        }
      }
    }

    if free_in_lists != free_in_heap {
      return Err(corrupt(Block(ROOT), "free block missing from its list"));
    }
    Ok(())
  }

  #[inline]
  fn tripwire(&self) -> Result<(), Trap> {
    if cfg!(feature = "debug-tripwire") {
      self.verify()
    } else {
      Ok(())
    }
  }
}

/// Iterator returned by [`Heap::blocks`].
pub struct Blocks<'a, M: Memory> {
  heap: &'a Heap<M>,
  cursor: Option<Block>,
  tail: Option<Block>,
}

impl<M: Memory> Blocks<'_, M> {
  fn step(&self, block: Block) -> Result<(BlockView, Block), Trap> {
    let info = self.heap.info(block)?;
    let size = checked_size(block, info)?;
    let view = BlockView {
      offset: block.0,
      payload: block.payload(),
      size,
      free: info.is_free(),
    };
    Ok((view, self.heap.right_of(block, info)?))
  }
}

impl<M: Memory> Iterator for Blocks<'_, M> {
  type Item = Result<BlockView, Trap>;

  fn next(&mut self) -> Option<Self::Item> {
    let block = self.cursor.take()?;
    if Some(block) == self.tail {
      return None;
    }
    match self.step(block) {
      Ok((view, right)) => {
        self.cursor = Some(right);
        Some(Ok(view))
      }
      Err(trap) => Some(Err(trap)),
    }
  }
}

// =============================================================================
// Process Runtime
// =============================================================================

#[cfg(unix)]
pub type HostMemory = MmapMemory;
#[cfg(not(unix))]
pub type HostMemory = VecMemory;

#[cfg(unix)]
fn host_memory() -> Result<HostMemory, Trap> {
  MmapMemory::new(MAX_PAGES).ok_or(Trap::OutOfMemory { requested: 0 })
}

#[cfg(not(unix))]
fn host_memory() -> Result<HostMemory, Trap> {
  Ok(VecMemory::new(MAX_PAGES))
}

thread_local! {
  static RUNTIME: RefCell<Option<Heap<HostMemory>>> = const { RefCell::new(None) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on this thread's heap, building it on first use. Entering again
/// from inside `f` (e.g. from a finalizer) is a [`Trap::Reentrancy`].
pub fn try_with_runtime<R>(
  f: impl FnOnce(&mut Heap<HostMemory>) -> Result<R, Trap>,
) -> Result<R, Trap> {
  let Some(_guard) = InAllocGuard::enter() else {
    return Err(Trap::Reentrancy);
  };

  RUNTIME.with(|slot| {
    let mut slot = slot.borrow_mut();
    let heap = match slot.take() {
      Some(heap) => heap,
      None => Heap::new(host_memory()?)?,
    };
    f(slot.insert(heap))
  })
}

/// Holds `IN_ALLOC` for one runtime entry. Cleared on drop, so an unwinding
/// caller does not leave the thread locked out.
struct InAllocGuard;

impl InAllocGuard {
  fn enter() -> Option<Self> {
    IN_ALLOC.with(|flag| (!flag.replace(true)).then_some(Self))
  }
}

impl Drop for InAllocGuard {
  fn drop(&mut self) {
    IN_ALLOC.with(|flag| flag.set(false));
  }
}

#[cold]
fn fatal(trap: Trap) -> ! {
  error!(code = trap.code(), %trap, "fatal allocator trap");
  std::process::abort()
}

pub fn alloc(size: u32, type_id: u32) -> u32 {
  try_with_runtime(|heap| heap.alloc(size, type_id)).unwrap_or_else(|trap| fatal(trap))
}

pub fn retain(ptr: u32) -> u32 {
  try_with_runtime(|heap| heap.retain(ptr)).unwrap_or_else(|trap| fatal(trap))
}

pub fn release(ptr: u32) {
  try_with_runtime(|heap| heap.release(ptr)).unwrap_or_else(|trap| fatal(trap))
}

pub fn collect() {
  try_with_runtime(|heap| {
    heap.collect();
    Ok(())
  })
  .unwrap_or_else(|trap| fatal(trap))
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static __rtti_base: u32 = RTTI_BASE;

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn __alloc(size: u32, type_id: u32) -> u32 {
  alloc(size, type_id)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn __retain(ptr: u32) -> u32 {
  retain(ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn __release(ptr: u32) {
  release(ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn __collect() {
  collect()
}

/// Base of the arena. Stable for the life of the thread's heap.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn __memory_base() -> *mut u8 {
  try_with_runtime(|heap| Ok(heap.arena_mut().as_mut_ptr())).unwrap_or_else(|trap| fatal(trap))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn __memory_size() -> usize {
  try_with_runtime(|heap| Ok(heap.arena().len())).unwrap_or_else(|trap| fatal(trap))
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: u32, align: u32) -> u32 {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod proptests {
  use super::*;
  use proptest::prelude::*;

  proptest! {
    #[test]
    fn class_of_is_monotonic(a in 16u32..BLOCK_MAXSIZE, b in 16u32..BLOCK_MAXSIZE) {
      let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
      prop_assert!(SizeClass::of(lo) <= SizeClass::of(hi));
    }

    #[test]
    fn search_class_never_under_allocates(units in 1u32..(ROUNDING_LIMIT >> AL_BITS)) {
      let size = units << AL_BITS;
      let class = SizeClass::search(size);
      prop_assert!(class.min_size() >= size);
      prop_assert!((class.major as usize) < FL_COUNT);
    }

    #[test]
    fn blocks_file_under_a_class_they_satisfy(units in 1u32..(BLOCK_MAXSIZE >> AL_BITS)) {
      let size = units << AL_BITS;
      prop_assert!(SizeClass::of(size).min_size() <= size);
    }
  }
}
