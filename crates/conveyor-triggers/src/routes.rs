// Route collection
//
// Trigger modules and resource handlers contribute axum routers during
// init; the HTTP server module drains the collector once at start and
// merges everything into the served router.

use std::sync::Mutex;

use axum::Router;

#[derive(Default)]
pub struct RouteCollector {
    routers: Mutex<Vec<Router>>,
}

impl RouteCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, router: Router) {
        self.routers.lock().expect("route collector poisoned").push(router);
    }

    /// Take every contributed router. Called once by the server at start.
    pub fn drain(&self) -> Vec<Router> {
        std::mem::take(&mut *self.routers.lock().expect("route collector poisoned"))
    }
}
