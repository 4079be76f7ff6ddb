mod batch;
mod dpid;
mod lifecycle;
mod limit;
mod pair;

mod support {
    use std::sync::Arc;

    use netlab::{node::mock::MockShell, Env, Platform, Registry};

    pub fn mock_env(platform: Platform) -> (Arc<MockShell>, Env) {
        let _ = tracing_subscriber::fmt::try_init();

        let shell = Arc::new(MockShell::new());
        let env = Env::new(shell.clone(), platform, Arc::new(Registry::new()));
        (shell, env)
    }

    /// A port nothing listens on right now.
    pub async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }
}
