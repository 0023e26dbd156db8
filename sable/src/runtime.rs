//! The seam between the execution core and deployed contract code.

use std::rc::Rc;

use crate::{apply_context::ApplyContext, error::Result};

/// Implemented by whatever runs the code deployed on an account (a VM, a
/// native test contract, ...). The runtime gets the full action API
/// through the apply context it is handed.
pub trait ContractRuntime {
    fn apply(&self, ctx: &mut ApplyContext) -> Result<()>;
}

/// Closures work as contracts, which keeps tests and tooling light.
impl<F> ContractRuntime for F
where
    F: for<'a, 'b> Fn(&mut ApplyContext<'a, 'b>) -> Result<()>,
{
    fn apply(&self, ctx: &mut ApplyContext) -> Result<()> {
        self(ctx)
    }
}

pub type RuntimeHandle = Rc<dyn ContractRuntime>;
