use proptest::prelude::*;
use proptest::sample::Index;
use pureheap::{Heap, ObjectKind, VecMemory};

#[derive(Clone, Debug)]
enum Op {
  Alloc(u32),
  Release(Index),
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    6 => (0u32..2048).prop_map(Op::Alloc),
    1 => (2048u32..150_000).prop_map(Op::Alloc),
    5 => any::<Index>().prop_map(Op::Release),
  ]
}

/// A live object: payload pointer, capacity and the byte its payload is filled with.
struct Object {
  ptr: u32,
  capacity: u32,
  fill: u8,
}

fn overlaps(a: &Object, b: &Object) -> bool {
  a.ptr < b.ptr + b.capacity && b.ptr < a.ptr + a.capacity
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(64))]

  #[test]
  fn random_workloads_keep_the_heap_consistent(ops in prop::collection::vec(op(), 1..96)) {
    let mut heap = Heap::new(VecMemory::new(1024)).unwrap();
    let mut objects: Vec<Object> = Vec::new();

    for (step, op) in ops.into_iter().enumerate() {
      match op {
        Op::Alloc(size) => {
          let ptr = heap.alloc(size, ObjectKind::Buffer.id()).unwrap();
          heap.retain(ptr).unwrap();
          let capacity = heap.capacity(ptr).unwrap();
          prop_assert_eq!(ptr % 16, 0);
          prop_assert!(capacity >= size);

          let object = Object { ptr, capacity, fill: step as u8 };
          for other in &objects {
            prop_assert!(!overlaps(&object, other), "{:#x} overlaps {:#x}", ptr, other.ptr);
          }
          heap.arena_mut().bytes_mut(ptr, capacity).unwrap().fill(object.fill);
          objects.push(object);
        }
        Op::Release(index) => {
          if objects.is_empty() {
            continue;
          }
          let object = objects.swap_remove(index.index(objects.len()));
          let payload = heap.arena().bytes(object.ptr, object.capacity).unwrap();
          prop_assert!(payload.iter().all(|&byte| byte == object.fill));
          heap.release(object.ptr).unwrap();
        }
      }
      heap.verify().unwrap();
    }

    let stats = heap.stats().unwrap();
    prop_assert_eq!(stats.live_blocks, objects.len());

    for object in objects.drain(..) {
      heap.release(object.ptr).unwrap();
    }
    let stats = heap.stats().unwrap();
    prop_assert_eq!(stats.live_blocks, 0);
    prop_assert_eq!(stats.free_blocks, 1);
    heap.verify().unwrap();
  }

  #[test]
  fn balanced_retains_free_only_on_the_last_release(size in 0u32..4096, extra in 0u32..32) {
    let mut heap = Heap::new(VecMemory::new(4)).unwrap();
    let ptr = heap.alloc(size, ObjectKind::String.id()).unwrap();
    for _ in 0..=extra {
      heap.retain(ptr).unwrap();
    }
    for remaining in (0..extra).rev() {
      heap.release(ptr).unwrap();
      prop_assert_eq!(heap.refcount(ptr).unwrap(), remaining + 1);
    }
    heap.release(ptr).unwrap();
    prop_assert!(heap.refcount(ptr).is_err());
    prop_assert_eq!(heap.stats().unwrap().live_blocks, 0);
  }
}
