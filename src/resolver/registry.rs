//! Registry of resolvers keyed by source name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use log::debug;
use reqwest::Url;

use crate::definition::{Definition, DefinitionParseError};
use crate::error::PkgError;
use crate::package::Package;

use super::{
    CatalogueEntry, CurseResolver, GitHubResolver, Resolver, ResolverContext, SourceMetadata,
    WowiResolver,
};

/// Rejects definitions whose strategy the wrapped resolver does not support.
struct StrategyChecked {
    inner: Arc<dyn Resolver>,
}

impl StrategyChecked {
    fn check(&self, def: &Definition) -> Result<(), PkgError> {
        if self.inner.metadata().supports(&def.strategy) {
            Ok(())
        } else {
            Err(PkgError::StrategyUnsupported(def.strategy.clone()))
        }
    }
}

#[async_trait]
impl Resolver for StrategyChecked {
    fn metadata(&self) -> &SourceMetadata {
        self.inner.metadata()
    }

    fn get_alias_from_url(&self, url: &Url) -> Option<String> {
        self.inner.get_alias_from_url(url)
    }

    async fn resolve(
        &self,
        ctx: &ResolverContext,
        defs: &[Definition],
    ) -> Vec<Result<Package, PkgError>> {
        let mut results: Vec<Option<Result<Package, PkgError>>> = Vec::with_capacity(defs.len());
        let mut supported = Vec::new();
        let mut positions = Vec::new();
        for (i, def) in defs.iter().enumerate() {
            match self.check(def) {
                Ok(()) => {
                    supported.push(def.clone());
                    positions.push(i);
                    results.push(None);
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }

        if !supported.is_empty() {
            let resolved = self.inner.resolve(ctx, &supported).await;
            for (position, result) in positions.into_iter().zip(resolved) {
                results[position] = Some(result);
            }
        }

        // A resolver returning too few results is a bug in that resolver
        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(PkgError::internal(anyhow::anyhow!(
                        "{} returned no result for this definition",
                        self.inner.metadata().id
                    )))
                })
            })
            .collect()
    }

    async fn resolve_one(
        &self,
        ctx: &ResolverContext,
        def: &Definition,
        metadata: Option<serde_json::Value>,
    ) -> Result<Package, PkgError> {
        self.check(def)?;
        self.inner.resolve_one(ctx, def, metadata).await
    }

    fn collect_items<'a>(
        &'a self,
        ctx: &'a ResolverContext,
    ) -> BoxStream<'a, anyhow::Result<CatalogueEntry>> {
        self.inner.collect_items(ctx)
    }

    fn supports_rollback(&self) -> bool {
        self.inner.supports_rollback()
    }
}

/// Resolvers by source name, each wrapped with the strategy check.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: BTreeMap<String, Arc<dyn Resolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in source at its public endpoint.
    pub fn with_default_sources() -> Self {
        let mut registry = Self::new();
        registry.register(GitHubResolver::new());
        registry.register(WowiResolver::new());
        registry.register(CurseResolver::new());
        registry
    }

    /// Registers a resolver under its source ID, replacing any previous one.
    pub fn register(&mut self, resolver: impl Resolver + 'static) {
        let id = resolver.metadata().id.to_string();
        debug!("Registering resolver {}", id);
        let checked = StrategyChecked {
            inner: Arc::new(resolver),
        };
        self.resolvers.insert(id, Arc::new(checked));
    }

    pub fn get(&self, source: &str) -> Option<&Arc<dyn Resolver>> {
        self.resolvers.get(source)
    }

    pub fn has(&self, source: &str) -> bool {
        self.resolvers.contains_key(source)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Resolver>)> {
        self.resolvers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Parses `source:alias` or a URL one of the registered sources recognises.
    pub fn parse_definition(&self, text: &str) -> Result<Definition, DefinitionParseError> {
        let text = text.trim();
        if let Ok(url) = Url::parse(text)
            && matches!(url.scheme(), "http" | "https")
        {
            return self
                .resolvers
                .iter()
                .find_map(|(source, resolver)| {
                    resolver
                        .get_alias_from_url(&url)
                        .map(|alias| Definition::new(source.as_str(), alias))
                })
                .ok_or_else(|| DefinitionParseError(text.to_string()));
        }
        text.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Flavour;
    use crate::definition::{Strategy, StrategyTag};
    use crate::package::test_support::package;
    use crate::resolver::test_support::context;
    use std::sync::Mutex;

    /// Resolver that echoes each definition back as a package.
    struct EchoResolver {
        seen: Seen,
    }

    static ECHO: SourceMetadata = SourceMetadata {
        id: "echo",
        name: "Echo",
        strategies: &[StrategyTag::Default, StrategyTag::Latest],
    };

    #[async_trait]
    impl Resolver for EchoResolver {
        fn metadata(&self) -> &SourceMetadata {
            &ECHO
        }

        fn get_alias_from_url(&self, url: &Url) -> Option<String> {
            (url.host_str() == Some("echo.example")).then(|| url.path().trim_matches('/').to_string())
        }

        async fn resolve(
            &self,
            ctx: &ResolverContext,
            defs: &[Definition],
        ) -> Vec<Result<Package, PkgError>> {
            self.seen.lock().unwrap().push(defs.to_vec());
            let mut out = vec![];
            for def in defs {
                out.push(self.resolve_one(ctx, def, None).await);
            }
            out
        }

        async fn resolve_one(
            &self,
            _ctx: &ResolverContext,
            def: &Definition,
            _metadata: Option<serde_json::Value>,
        ) -> Result<Package, PkgError> {
            if def.alias == "missing" {
                return Err(PkgError::Nonexistent);
            }
            Ok(package("echo", &def.alias, &def.alias, &[]))
        }
    }

    type Seen = Arc<Mutex<Vec<Vec<Definition>>>>;

    fn registry() -> (ResolverRegistry, Seen) {
        let seen = Seen::default();
        let mut registry = ResolverRegistry::new();
        registry.register(EchoResolver { seen: seen.clone() });
        (registry, seen)
    }

    #[tokio::test]
    async fn test_unsupported_strategy_never_reaches_resolver() {
        let (registry, seen) = registry();
        let resolver = registry.get("echo").unwrap();
        let ctx = context(Flavour::Retail);

        let defs = vec![
            Definition::new("echo", "a"),
            Definition::new("echo", "b").with_version("1.0"),
            Definition::new("echo", "c").with_strategy(Strategy::Latest),
        ];
        let results = resolver.resolve(&ctx, &defs).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().id, "a");
        assert!(matches!(
            &results[1],
            Err(PkgError::StrategyUnsupported(Strategy::Version(v))) if v == "1.0"
        ));
        assert_eq!(results[2].as_ref().unwrap().id, "c");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_one_is_checked() {
        let (registry, _) = registry();
        let resolver = registry.get("echo").unwrap();
        let ctx = context(Flavour::Retail);

        let def = Definition::new("echo", "a").with_strategy(Strategy::Beta);
        assert!(matches!(
            resolver.resolve_one(&ctx, &def, None).await,
            Err(PkgError::StrategyUnsupported(Strategy::Beta))
        ));
        assert!(!resolver.supports_rollback());
    }

    #[test]
    fn test_parse_definition() {
        let (registry, _) = registry();

        let def = registry.parse_definition("echo:foo").unwrap();
        assert_eq!((def.source.as_str(), def.alias.as_str()), ("echo", "foo"));

        let def = registry.parse_definition("https://echo.example/bar").unwrap();
        assert_eq!((def.source.as_str(), def.alias.as_str()), ("echo", "bar"));

        assert!(registry.parse_definition("https://unknown.example/x").is_err());
        assert!(registry.parse_definition("no-colon").is_err());
    }

    #[test]
    fn test_default_sources() {
        let registry = ResolverRegistry::with_default_sources();
        let sources: Vec<_> = registry.iter().map(|(name, _)| name).collect();
        assert_eq!(sources, vec!["curse", "github", "wowi"]);
        assert!(registry.get("github").unwrap().supports_rollback());
        assert!(!registry.get("wowi").unwrap().supports_rollback());

        let def = registry
            .parse_definition("https://www.curseforge.com/wow/addons/molinari")
            .unwrap();
        assert_eq!(def.to_string(), "curse:molinari");
    }
}
