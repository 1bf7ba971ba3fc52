#![allow(dead_code)]

pub mod stack;
