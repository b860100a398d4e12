mod documents;
mod lifecycle;
mod notifications;
mod watched_files;
#[cfg(unix)]
mod worker_process;
