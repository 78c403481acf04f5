//! Candidate implementations and their registry.

use anyhow::Result;
use std::sync::Arc;

/// One concrete implementation of an operation variant.
pub trait Candidate<P, D: ?Sized>: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, _params: &P) -> bool {
        true
    }

    /// Enqueue the operation on the device's current stream.
    fn run(&self, params: &P, device: &D) -> Result<()>;
}

pub type DynCandidate<P, D> = Arc<dyn Candidate<P, D>>;

/// Ordered candidates. The first registered one is the default
/// implementation, used as the numerical reference and as the fallback.
pub struct CandidateRegistry<P, D: ?Sized> {
    candidates: Vec<DynCandidate<P, D>>,
}

impl<P, D: ?Sized> Clone for CandidateRegistry<P, D> {
    fn clone(&self) -> Self {
        Self {
            candidates: self.candidates.clone(),
        }
    }
}

impl<P, D: ?Sized> Default for CandidateRegistry<P, D> {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
        }
    }
}

impl<P, D: ?Sized> CandidateRegistry<P, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C>(&mut self, candidate: C) -> &mut Self
    where
        C: Candidate<P, D> + 'static,
    {
        self.candidates.push(Arc::new(candidate));
        self
    }

    pub fn register_shared(&mut self, candidate: DynCandidate<P, D>) -> &mut Self {
        self.candidates.push(candidate);
        self
    }

    pub fn candidates(&self) -> &[DynCandidate<P, D>] {
        &self.candidates
    }

    pub fn default_candidate(&self) -> Option<&DynCandidate<P, D>> {
        self.candidates.first()
    }

    pub fn find(&self, name: &str) -> Option<&DynCandidate<P, D>> {
        self.candidates
            .iter()
            .find(|candidate| candidate.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Candidate<u32, ()> for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn supports(&self, params: &u32) -> bool {
            *params < 10
        }

        fn run(&self, _params: &u32, _device: &()) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_registered_is_default() {
        let mut registry = CandidateRegistry::<u32, ()>::new();
        assert!(registry.default_candidate().is_none());
        registry.register(Named("slow")).register(Named("fast"));
        assert_eq!(registry.default_candidate().unwrap().name(), "slow");
        assert_eq!(registry.names(), vec!["slow", "fast"]);
        assert!(registry.find("fast").is_some());
        assert!(registry.find("missing").is_none());
        assert!(!registry.candidates()[1].supports(&12));
        assert_eq!(registry.clone().len(), 2);
    }
}
