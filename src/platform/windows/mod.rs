mod entry;
mod hooks;
mod probe;
mod protect;
mod readback;
mod share;

pub(crate) use hooks::{activate, deactivate};
