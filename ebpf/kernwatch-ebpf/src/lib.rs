#![no_std]

// This file exists to enable the library target; the probes live in main.rs
// and are only ever compiled for the bpf target by aya-build.
