#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! AST lint: `.await` while a lock guard is alive.
//!
//! Plain `Mutex`/`RwLock` guards must be released before suspending. Keyed
//! board and user locks (`acquire`) are the exception: they exist to
//! serialize a whole read-modify-write sequence against the store, so they
//! are held across store calls on purpose. Those sites are listed in
//! [`ALLOWLIST`] by guard name; anything else is a violation.
//!
//! ```ignore
//! // flagged
//! let guard = state.write().await;
//! store.put_board(board).await?;
//!
//! // fine
//! let snapshot = { state.read().await.clone() };
//! store.put_board(board).await?;
//! ```

use std::fs;
use std::path::Path;
use syn::visit::Visit;
use syn::{Expr, ExprAwait, File, Local, Pat};
use walkdir::WalkDir;

struct GuardTracker {
    current_file: String,
    scope_depth: usize,
    /// (guard name, scope depth at binding)
    guards: Vec<(String, usize)>,
    violations: Vec<(String, Vec<String>)>,
}

impl GuardTracker {
    fn new(file: String) -> Self {
        Self {
            current_file: file,
            scope_depth: 0,
            guards: Vec::new(),
            violations: Vec::new(),
        }
    }

    fn acquires_lock(method: &str) -> bool {
        matches!(
            method,
            "lock"
                | "read"
                | "write"
                | "try_lock"
                | "try_read"
                | "try_write"
                | "acquire"
                | "acquire_many"
        )
    }

    fn is_lock_expr(expr: &Expr) -> bool {
        let expr = match expr {
            Expr::Await(awaited) => &*awaited.base,
            other => other,
        };
        matches!(expr, Expr::MethodCall(call) if Self::acquires_lock(&call.method.to_string()))
    }

    fn held(&self) -> Vec<String> {
        self.guards.iter().map(|(name, _)| name.clone()).collect()
    }
}

impl<'ast> Visit<'ast> for GuardTracker {
    fn visit_local(&mut self, local: &'ast Local) {
        if let Some(init) = &local.init {
            if Self::is_lock_expr(&init.expr) {
                if let Pat::Ident(ident) = &local.pat {
                    self.guards
                        .push((ident.ident.to_string(), self.scope_depth));
                }
            }
        }
        syn::visit::visit_local(self, local);
    }

    fn visit_expr_await(&mut self, awaited: &'ast ExprAwait) {
        let is_acquisition = matches!(
            &*awaited.base,
            Expr::MethodCall(call) if Self::acquires_lock(&call.method.to_string())
        );
        if !is_acquisition && !self.guards.is_empty() {
            self.violations
                .push((self.current_file.clone(), self.held()));
        }
        syn::visit::visit_expr_await(self, awaited);
    }

    fn visit_block(&mut self, block: &'ast syn::Block) {
        self.scope_depth += 1;
        syn::visit::visit_block(self, block);
        let depth = self.scope_depth;
        self.guards.retain(|(_, d)| *d < depth);
        self.scope_depth -= 1;
    }

    fn visit_expr_call(&mut self, call: &'ast syn::ExprCall) {
        if let Expr::Path(func) = &*call.func {
            if func.path.is_ident("drop") {
                if let Some(Expr::Path(arg)) = call.args.first() {
                    if let Some(ident) = arg.path.get_ident() {
                        let name = ident.to_string();
                        self.guards.retain(|(g, _)| *g != name);
                    }
                }
            }
        }
        syn::visit::visit_expr_call(self, call);
    }
}

fn check_source(file: &str, source: &str) -> Vec<(String, Vec<String>)> {
    let syntax: File = match syn::parse_file(source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Warning: Failed to parse {}: {}", file, e);
            return vec![];
        }
    };
    let mut tracker = GuardTracker::new(file.to_string());
    tracker.visit_file(&syntax);
    tracker.violations
}

/// Guards held across awaits on purpose. Format: (file suffix, guard, reason)
const ALLOWLIST: &[(&str, &str, &str)] = &[
    ("locks.rs", "_held", "Exclusivity test holds the key while sleeping"),
    ("locks.rs", "_a", "Independence test holds one key while taking another"),
    ("store/file.rs", "_flush_guard", "Disk writes land in mutation order"),
    ("boards/allocator.rs", "_board_guard", "Relay flag read-modify-write"),
    ("boards/registry.rs", "_board_guard", "Board lifecycle read-modify-write"),
    ("boards/registry.rs", "_user_guard", "Room lookup during registration"),
    ("boards/registry.rs", "user_guard", "Cascade rewrite of one user's rooms"),
    ("appliances/manager.rs", "_board_guard", "Reserve and bind in one step"),
    ("appliances/manager.rs", "user_guard", "Appliance create/remove"),
    ("appliances/manager.rs", "_user_guard", "Appliance edits"),
    ("appliances/rooms.rs", "_user_guard", "Room edits"),
    ("appliances/rooms.rs", "user_guard", "Detection signal write"),
    ("appliances/rooms.rs", "board_guards", "Room delete unregisters its boards"),
];

fn is_allowed(file: &str, guard: &str) -> bool {
    ALLOWLIST
        .iter()
        .any(|(suffix, allowed, _)| file.ends_with(suffix) && guard == *allowed)
}

#[test]
fn flags_await_under_write_guard() {
    let code = r#"
        async fn example() {
            let guard = state.write().await;
            save().await;
        }
    "#;
    let found = check_source("test.rs", code);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].1, vec!["guard".to_string()]);
}

#[test]
fn flags_await_under_keyed_lock() {
    let code = r#"
        async fn example() {
            let held = locks.boards.acquire("b").await;
            store.put_board(board).await;
        }
    "#;
    assert!(!check_source("test.rs", code).is_empty());
}

#[test]
fn allows_guard_scoped_before_await() {
    let code = r#"
        async fn example() {
            let value = {
                let guard = state.read().await;
                guard.value.clone()
            };
            save(value).await;
        }
    "#;
    assert!(check_source("test.rs", code).is_empty());
}

#[test]
fn allows_explicit_drop_before_await() {
    let code = r#"
        async fn example() {
            let guard = state.write().await;
            let value = guard.value.clone();
            drop(guard);
            save(value).await;
        }
    "#;
    assert!(check_source("test.rs", code).is_empty());
}

#[test]
fn no_await_in_lock_violations() {
    let src_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut report = Vec::new();

    for entry in WalkDir::new(&src_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
    {
        let file = entry.path().display().to_string();
        let Ok(source) = fs::read_to_string(entry.path()) else {
            continue;
        };
        for (file, guards) in check_source(&file, &source) {
            if !guards.iter().all(|g| is_allowed(&file, g)) {
                report.push(format!("  - {}: holding {}", file, guards.join(", ")));
            }
        }
    }

    if !report.is_empty() {
        panic!(
            "\n\nFound .await while holding a lock guard.\n\
             Release the guard first, or add the site to ALLOWLIST if the\n\
             guard must span the await.\n\nViolations:\n{}\n",
            report.join("\n")
        );
    }
}
