// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for MySQL.
//!
//! Provides helpers to spin up a MySQL engine for the tests that talk to a
//! real server.

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const MYSQL_ROOT_PASSWORD: &str = "sidecar-test";

/// Create a MySQL 8.0 container.
///
/// The entrypoint starts a temporary server on port 0 while initialising;
/// waiting for the 3306 banner skips past it.
pub fn mysql_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("mysql", "8.0")
        .with_env_var("MYSQL_ROOT_PASSWORD", MYSQL_ROOT_PASSWORD)
        .with_exposed_port(3306)
        .with_wait_for(WaitFor::message_on_stderr("port: 3306"));
    docker.run(image)
}

/// Admin URL for a container.
pub fn mysql_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(3306);
    format!("mysql://root:{}@127.0.0.1:{}", MYSQL_ROOT_PASSWORD, port)
}
