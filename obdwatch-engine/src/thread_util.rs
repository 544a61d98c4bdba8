//! Helper for spawning named threads

use std::io;
use std::thread::JoinHandle;

/// Spawn a thread with a name that shows up in debuggers and panic messages.
///
/// # Example
/// ```ignore
/// spawn_named("my_task", || { /* ... */ })?;
/// ```
pub fn spawn_named<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new().name(name.to_string()).spawn(f)
}
