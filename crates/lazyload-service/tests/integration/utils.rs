use std::path::Path;
use std::sync::Arc;

use lazyload_service::config::Config;
use lazyload_service::services::{Collaborators, Loader};
use lazyload_test::Recorder;

/// Creates a loader storing into `storage_dir` that applies handle deliveries to `sink`.
pub fn setup_loader<F>(storage_dir: &Path, sink: &Recorder, update_config: F) -> Arc<Loader>
where
    F: FnOnce(&mut Config),
{
    lazyload_test::setup();

    let mut config = lazyload_test::config(storage_dir);
    update_config(&mut config);

    let collaborators = Collaborators::from_config(&config)
        .unwrap()
        .with_sink(sink.clone());
    Loader::initialize(&config, tokio::runtime::Handle::current(), collaborators).unwrap()
}
