//! Provider fallback catalog.
//!
//! Maps each (capability, tier) pair to an ordered chain of provider
//! candidates, best first, and carries the per-call price used when a
//! provider does not report its own cost. Chains never change mid-run;
//! the selector reads them once per item.

use std::collections::HashMap;

use thiserror::Error;

use fable_models::{Capability, PlanTier, ProviderId};

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("No providers configured for {capability} at tier {tier}")]
    EmptyChain {
        capability: Capability,
        tier: PlanTier,
    },

    #[error("Provider {0} appears in a chain but has no price")]
    UnpricedProvider(ProviderId),
}

/// Ordered provider chains per capability and tier.
#[derive(Debug, Clone)]
pub struct FallbackCatalog {
    chains: HashMap<(Capability, PlanTier), Vec<ProviderId>>,
    prices: HashMap<ProviderId, u64>,
}

impl FallbackCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self {
            chains: HashMap::new(),
            prices: HashMap::new(),
        }
    }

    /// Built-in chains: paid tiers get the strong model first with cheaper
    /// fallbacks behind it, the free tier starts on the cheap model.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();

        for (provider, cents) in [
            ("scriptor-xl", 40),
            ("scriptor-mini", 15),
            ("muralist-v3", 12),
            ("muralist-turbo", 6),
            ("sketchline", 4),
            ("sonata-hd", 8),
            ("sonata-lite", 4),
            ("kinetix-1.5", 90),
            ("kinetix-flash", 45),
            ("syncwave-pro", 35),
            ("syncwave-lite", 18),
        ] {
            catalog.set_price(ProviderId::from(provider), cents);
        }

        use Capability::*;
        use PlanTier::*;

        catalog.set_chain(ScriptGeneration, Free, ["scriptor-mini"]);
        catalog.set_chain(ScriptGeneration, Creator, ["scriptor-xl", "scriptor-mini"]);
        catalog.set_chain(ScriptGeneration, Studio, ["scriptor-xl", "scriptor-mini"]);

        catalog.set_chain(ImageGeneration, Free, ["muralist-turbo", "sketchline"]);
        catalog.set_chain(ImageGeneration, Creator, ["muralist-v3", "muralist-turbo"]);
        catalog.set_chain(
            ImageGeneration,
            Studio,
            ["muralist-v3", "muralist-turbo", "sketchline"],
        );

        catalog.set_chain(AudioSynthesis, Free, ["sonata-lite"]);
        catalog.set_chain(AudioSynthesis, Creator, ["sonata-hd", "sonata-lite"]);
        catalog.set_chain(AudioSynthesis, Studio, ["sonata-hd", "sonata-lite"]);

        catalog.set_chain(VideoSynthesis, Free, ["kinetix-flash"]);
        catalog.set_chain(VideoSynthesis, Creator, ["kinetix-1.5", "kinetix-flash"]);
        catalog.set_chain(VideoSynthesis, Studio, ["kinetix-1.5", "kinetix-flash"]);

        catalog.set_chain(LipSync, Free, ["syncwave-lite"]);
        catalog.set_chain(LipSync, Creator, ["syncwave-pro", "syncwave-lite"]);
        catalog.set_chain(LipSync, Studio, ["syncwave-pro", "syncwave-lite"]);

        catalog
    }

    /// Replace the chain for a (capability, tier) pair.
    pub fn set_chain<I, P>(&mut self, capability: Capability, tier: PlanTier, providers: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<ProviderId>,
    {
        let chain = providers.into_iter().map(Into::into).collect();
        self.chains.insert((capability, tier), chain);
    }

    /// Set the fallback price for a provider.
    pub fn set_price(&mut self, provider: ProviderId, cents: u64) {
        self.prices.insert(provider, cents);
    }

    /// Ordered candidates for a capability at a tier. Empty when none are
    /// configured.
    pub fn chain(&self, capability: Capability, tier: PlanTier) -> &[ProviderId] {
        self.chains
            .get(&(capability, tier))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary (first) candidate for a capability at a tier.
    pub fn primary(&self, capability: Capability, tier: PlanTier) -> Option<&ProviderId> {
        self.chain(capability, tier).first()
    }

    /// Catalog price for one call to a provider.
    pub fn price_cents(&self, provider: &ProviderId) -> u64 {
        self.prices.get(provider).copied().unwrap_or(0)
    }

    /// Check that every capability/tier pair has a chain and every listed
    /// provider has a price.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for capability in Capability::ALL {
            for tier in PlanTier::ALL {
                let chain = self.chain(capability, tier);
                if chain.is_empty() {
                    return Err(CatalogError::EmptyChain { capability, tier });
                }
                for provider in chain {
                    if !self.prices.contains_key(provider) {
                        return Err(CatalogError::UnpricedProvider(provider.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for FallbackCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}
