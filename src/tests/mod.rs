//! Consolidated cross-module scenario tests.

#[cfg(test)]
mod scenarios;
