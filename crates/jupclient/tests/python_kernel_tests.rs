//
// python_kernel_tests.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Smoke tests against a real Python kernel, when one is installed.
//!
//! These tests discover kernels with the `jupyter` command line tool and skip
//! quietly when no Python kernel is available, so they can run in environments
//! without Jupyter.

use jupclient::{ExecutionStatus, SessionRegistry};

#[tokio::test]
async fn test_python_execute_end_to_end() {
    let registry = SessionRegistry::with_discovered_kernels().await;
    if registry.resolve_language("python").is_none() {
        eprintln!("No Python kernel installed; skipping");
        return;
    }

    let session_id = registry
        .start_for_language("python")
        .await
        .expect("failed to start Python kernel");

    let result = registry
        .execute(&session_id, "1 + 1")
        .await
        .expect("execution failed");
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert!(
        result.text().unwrap_or_default().contains('2'),
        "expected '2' in {:?}",
        result.text()
    );

    // A kernel-side error comes back inside the result
    let result = registry
        .execute(&session_id, "1 / 0")
        .await
        .expect("execution failed");
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(
        result.error.expect("missing error details").ename,
        "ZeroDivisionError"
    );

    registry
        .stop_session(&session_id)
        .await
        .expect("failed to stop session");
    assert!(registry.list_sessions().is_empty());
}
