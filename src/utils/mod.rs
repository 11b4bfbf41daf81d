pub mod key;

pub(crate) mod time;

mod scoped_timer;
pub(crate) use scoped_timer::ScopedTimer;

#[cfg(test)]
mod key_test;
