use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pureheap::{Heap, ObjectKind, VecMemory};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// alloc/retain/release cycles on a private heap.
fn heap_alloc_release(heap: &mut Heap<VecMemory>, size: u32) {
  for _ in 0..OPS {
    let ptr = heap.alloc(size, ObjectKind::Buffer.id()).unwrap();
    heap.retain(black_box(ptr)).unwrap();
    heap.release(ptr).unwrap();
  }
}

/// Same cycle through the thread-local runtime.
fn runtime_alloc_release(size: u32) {
  for _ in 0..OPS {
    let ptr = pureheap::retain(pureheap::alloc(size, ObjectKind::Buffer.id()));
    pureheap::release(black_box(ptr));
  }
}

/// Allocates a batch, then releases it in allocation order so every free
/// coalesces with its left neighbor.
fn heap_batch(heap: &mut Heap<VecMemory>, size: u32, ptrs: &mut Vec<u32>) {
  for _ in 0..OPS / 1000 {
    for _ in 0..1000 {
      let ptr = heap.alloc(size, ObjectKind::Buffer.id()).unwrap();
      ptrs.push(heap.retain(ptr).unwrap());
    }
    for ptr in ptrs.drain(..) {
      heap.release(ptr).unwrap();
    }
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("heap", size), &size, |b, &size| {
      let mut heap = Heap::new(VecMemory::new(1024)).unwrap();
      b.iter(|| heap_alloc_release(&mut heap, size))
    });

    group.bench_with_input(BenchmarkId::new("runtime", size), &size, |b, &size| {
      b.iter(|| runtime_alloc_release(size))
    });

    group.bench_with_input(BenchmarkId::new("batch", size), &size, |b, &size| {
      let mut heap = Heap::new(VecMemory::new(1024)).unwrap();
      let mut ptrs = Vec::with_capacity(1000);
      b.iter(|| heap_batch(&mut heap, size, &mut ptrs))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
