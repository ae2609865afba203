//! Application shell state - the sidebar toggle shared by every screen

use std::sync::Arc;

use crate::binding::Field;
use crate::container::{StateContainer, Store};
use crate::engine::PersistEngine;

pub const SIDEBAR_VISIBLE_KEY: &str = "dev-utils::app-state::sidebar::visible";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppState {
    pub sidebar_visible: bool,
}

/// Store for [`AppState`] with the sidebar flag persisted.
#[derive(Clone)]
pub struct AppStore {
    store: Store<AppState>,
}

impl AppStore {
    pub fn new(engine: &Arc<PersistEngine>) -> Self {
        let store = Store::<AppState>::persisted(engine, |fields| AppState {
            sidebar_visible: fields.persist(
                true,
                Field::new(
                    SIDEBAR_VISIBLE_KEY,
                    |s: &AppState| s.sidebar_visible,
                    |s: &mut AppState, visible| s.sidebar_visible = visible,
                ),
            ),
        });

        Self { store }
    }

    pub fn sidebar_visible(&self) -> bool {
        self.store.read(|s| s.sidebar_visible)
    }

    pub fn toggle_sidebar(&self) {
        self.store.patch(|s| s.sidebar_visible = !s.sidebar_visible);
    }

    pub fn store(&self) -> &Store<AppState> {
        &self.store
    }
}
