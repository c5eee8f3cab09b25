//! Unit tests for the vmx_vcpu crate, run against the simulated processor in
//! [`crate::test_utils::mock`].

mod run_loop;
