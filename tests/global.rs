#![cfg(feature = "global")]

extern crate segmalloc;

use std::collections::HashMap;
use std::thread;

#[global_allocator]
static A: segmalloc::GlobalSegmalloc = segmalloc::GlobalSegmalloc;

#[test]
fn foo() {
    println!("hello");
}

#[test]
fn map() {
    let mut m = HashMap::new();
    m.insert(1, 2);
    m.insert(5, 3);
    drop(m);
}

#[test]
fn strings() {
    format!("foo, bar, {}", "baz");
}

#[test]
fn threads() {
    assert!(thread::spawn(|| panic!()).join().is_err());
}

#[test]
fn counts_live_bytes() {
    let v: Vec<u64> = (0..1000).collect();
    assert!(segmalloc::allocated_bytes() >= 8000);
    drop(v);
}
