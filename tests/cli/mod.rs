//! Worker process and protocol tests.

mod stream_test;
