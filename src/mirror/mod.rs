//! Mirror selection: rewriting canonical URLs into ranked candidate lists
//!
//! Three providers implement [`MirrorProvider`]:
//! - [`DirectProvider`] - the authoritative URL only
//! - [`MirrorPreferringProvider`] - prefix rewrite rules, Maven mirror fan-out,
//!   original URL last
//! - [`AutoProvider`] - both of the above merged and ranked by the
//!   [`MirrorScoreboard`]
//!
//! Rewrites are plain ordered string-prefix rules. The set of upstream hosts is
//! closed and known, so no URL templating is involved.

pub mod scoreboard;

pub use scoreboard::{MirrorScore, MirrorScoreboard, origin_key};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::MirrorConfig;
use crate::types::{CandidateSource, MirrorCandidate};

/// One prefix rewrite: URLs starting with `prefix` get it replaced by `replacement`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Upstream prefix, e.g. `https://libraries.minecraft.net`
    pub prefix: String,
    /// Mirror prefix substituted for it
    pub replacement: String,
}

impl RewriteRule {
    fn apply(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.prefix)
            .map(|rest| format!("{}{}", self.replacement, rest))
    }
}

/// Which provider variant to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMode {
    /// Authoritative sources only
    Direct,
    /// Mirrors first, authoritative source last
    Mirror,
    /// Mirrors and authoritative sources ranked by observed performance
    #[default]
    Auto,
}

/// Capability shared by every provider variant
pub trait MirrorProvider: Send + Sync {
    /// Candidate URLs of the version manifest, in priority order
    fn version_list_urls(&self) -> Vec<String>;

    /// Best single URL for `url`
    fn rewrite(&self, url: &str) -> String;

    /// Every equivalent URL for `url`, in priority order, with provenance
    fn candidates(&self, url: &str) -> Vec<MirrorCandidate>;

    /// Every equivalent URL for `url`, in priority order
    fn rewrite_with_candidates(&self, url: &str) -> Vec<String> {
        self.candidates(url).into_iter().map(|c| c.url).collect()
    }
}

/// Build the provider selected by `config.mode`
pub fn provider_for(
    config: &MirrorConfig,
    scoreboard: MirrorScoreboard,
) -> Arc<dyn MirrorProvider> {
    match config.mode {
        MirrorMode::Direct => Arc::new(DirectProvider::new(config)),
        MirrorMode::Mirror => Arc::new(MirrorPreferringProvider::new(config)),
        MirrorMode::Auto => Arc::new(AutoProvider::new(config, scoreboard)),
    }
}

/// Identity provider
#[derive(Clone, Debug)]
pub struct DirectProvider {
    version_manifest: String,
}

impl DirectProvider {
    /// Create a direct provider
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            version_manifest: config.version_manifest.clone(),
        }
    }
}

impl MirrorProvider for DirectProvider {
    fn version_list_urls(&self) -> Vec<String> {
        vec![self.version_manifest.clone()]
    }

    fn rewrite(&self, url: &str) -> String {
        url.to_string()
    }

    fn candidates(&self, url: &str) -> Vec<MirrorCandidate> {
        vec![MirrorCandidate::direct(url)]
    }
}

/// Rule-driven provider that prefers mirrors
#[derive(Clone, Debug)]
pub struct MirrorPreferringProvider {
    rules: Vec<RewriteRule>,
    maven_roots: Vec<String>,
    maven_mirrors: Vec<String>,
    version_manifest: String,
    version_manifest_mirror: String,
}

impl MirrorPreferringProvider {
    /// Create a provider from the configured rule tables
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            rules: config.rules.clone(),
            maven_roots: config.maven_roots.clone(),
            maven_mirrors: config.maven_mirrors.clone(),
            version_manifest: config.version_manifest.clone(),
            version_manifest_mirror: config.version_manifest_mirror.clone(),
        }
    }

    /// Artifact path of a Maven-shaped URL (the part after a well-known root)
    fn maven_path<'a>(&self, url: &'a str) -> Option<&'a str> {
        self.maven_roots.iter().find_map(|root| {
            url.strip_prefix(root.trim_end_matches('/'))
                .filter(|rest| rest.starts_with('/'))
        })
    }
}

impl MirrorProvider for MirrorPreferringProvider {
    fn version_list_urls(&self) -> Vec<String> {
        let mut urls = vec![self.version_manifest_mirror.clone()];
        push_unique(&mut urls, self.version_manifest.clone());
        urls
    }

    fn rewrite(&self, url: &str) -> String {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(url))
            .unwrap_or_else(|| url.to_string())
    }

    fn candidates(&self, url: &str) -> Vec<MirrorCandidate> {
        let mut out: Vec<MirrorCandidate> = Vec::new();

        if let Some(path) = self.maven_path(url) {
            for root in &self.maven_mirrors {
                let candidate = format!("{}{}", root.trim_end_matches('/'), path);
                push_unique_candidate(&mut out, MirrorCandidate::mirror(candidate));
            }
        }

        let rewritten = self.rewrite(url);
        if rewritten != url {
            push_unique_candidate(&mut out, MirrorCandidate::mirror(rewritten));
        }

        push_unique_candidate(&mut out, MirrorCandidate::direct(url));
        out
    }
}

/// Mirror and direct candidates merged and ranked by observed performance
#[derive(Clone, Debug)]
pub struct AutoProvider {
    mirror: MirrorPreferringProvider,
    direct: DirectProvider,
    scoreboard: MirrorScoreboard,
}

impl AutoProvider {
    /// Create an auto provider sharing `scoreboard`
    pub fn new(config: &MirrorConfig, scoreboard: MirrorScoreboard) -> Self {
        Self {
            mirror: MirrorPreferringProvider::new(config),
            direct: DirectProvider::new(config),
            scoreboard,
        }
    }

    fn merge_and_rank(&self, mirrored: Vec<MirrorCandidate>, direct: Vec<MirrorCandidate>) -> Vec<MirrorCandidate> {
        let mut merged: Vec<MirrorCandidate> = Vec::new();
        for candidate in mirrored.into_iter().chain(direct) {
            push_unique_candidate(&mut merged, candidate);
        }

        let urls: Vec<String> = merged.iter().map(|c| c.url.clone()).collect();
        self.scoreboard
            .rank(&urls)
            .into_iter()
            .map(|url| {
                let source = merged
                    .iter()
                    .find(|c| c.url == url)
                    .map(|c| c.source)
                    .unwrap_or(CandidateSource::Direct);
                MirrorCandidate { url, source }
            })
            .collect()
    }
}

impl MirrorProvider for AutoProvider {
    fn version_list_urls(&self) -> Vec<String> {
        let mut merged = self.mirror.version_list_urls();
        for url in self.direct.version_list_urls() {
            push_unique(&mut merged, url);
        }
        self.scoreboard.rank(&merged)
    }

    fn rewrite(&self, url: &str) -> String {
        self.candidates(url)
            .into_iter()
            .next()
            .map(|c| c.url)
            .unwrap_or_else(|| url.to_string())
    }

    fn candidates(&self, url: &str) -> Vec<MirrorCandidate> {
        self.merge_and_rank(self.mirror.candidates(url), self.direct.candidates(url))
    }
}

fn push_unique(list: &mut Vec<String>, url: String) {
    if !list.contains(&url) {
        list.push(url);
    }
}

fn push_unique_candidate(list: &mut Vec<MirrorCandidate>, candidate: MirrorCandidate) {
    if !list.iter().any(|c| c.url == candidate.url) {
        list.push(candidate);
    }
}
