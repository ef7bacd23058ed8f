//
// router.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Decides which language identifiers are served by Jupyter kernels.

use crate::error::KernelClientError;
use crate::kernel_spec::{KernelSpec, KernelSpecRegistry};

/// The prefix that explicitly requests a Jupyter kernel for a language, as in
/// `jupyter-python`.
const JUPYTER_PREFIX: &str = "jupyter-";

/// Bare language identifiers that route to Jupyter kernels without the
/// explicit prefix.
const SUPPORTED_LANGUAGES: &[&str] = &["python", "julia", "r"];

/// Routes language identifiers to kernel languages.
///
/// A host hands this component an interpreter identifier; the router decides
/// whether that identifier is served by a Jupyter kernel and, if so, which
/// language name to resolve against the [`KernelSpecRegistry`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LanguageRouter;

impl LanguageRouter {
    pub fn new() -> Self {
        Self
    }

    /// Whether `id` explicitly requests a Jupyter kernel, i.e. matches
    /// `jupyter-<name>` case-insensitively.
    pub fn is_explicit_jupyter(&self, id: &str) -> bool {
        self.parse_jupyter_language(id).is_some()
    }

    /// The lower-cased `<name>` from an explicit `jupyter-<name>` identifier,
    /// or `None` when the pattern does not match. The exact inverse of
    /// [`Self::is_explicit_jupyter`].
    pub fn parse_jupyter_language(&self, id: &str) -> Option<String> {
        if id.len() <= JUPYTER_PREFIX.len() {
            return None;
        }
        let (prefix, name) = id.split_at(JUPYTER_PREFIX.len());
        if prefix.eq_ignore_ascii_case(JUPYTER_PREFIX) {
            Some(name.to_ascii_lowercase())
        } else {
            None
        }
    }

    /// Whether `id` should be handled by this subsystem: either it carries
    /// the explicit `jupyter-` prefix, or it is a bare identifier for one of
    /// the supported languages.
    pub fn should_use_jupyter(&self, id: &str) -> bool {
        if self.is_explicit_jupyter(id) {
            return true;
        }
        SUPPORTED_LANGUAGES
            .iter()
            .any(|lang| lang.eq_ignore_ascii_case(id))
    }

    /// Resolve an identifier to a launchable kernel spec.
    ///
    /// Strips the explicit prefix if present and asks the registry for a
    /// kernel serving the language. Identifiers outside this subsystem yield
    /// `UnsupportedLanguage`; routable identifiers with no installed kernel
    /// yield `KernelNotFound`. Neither is fatal to the caller.
    pub fn resolve<'a>(
        &self,
        registry: &'a KernelSpecRegistry,
        id: &str,
    ) -> Result<&'a KernelSpec, KernelClientError> {
        if !self.should_use_jupyter(id) {
            return Err(KernelClientError::UnsupportedLanguage(id.to_string()));
        }
        let language = self
            .parse_jupyter_language(id)
            .unwrap_or_else(|| id.to_ascii_lowercase());
        registry
            .find_for_language(&language)
            .ok_or_else(|| KernelClientError::KernelNotFound(language))
    }
}
