pub mod c_utils;
mod header;
mod hls;

use crate::lower::PipelinePlan;
use crate::pprint::PlanPrintStyle;
use crate::utils::ToWriteFmt;

use std::fmt;
use std::io;

pub use self::hls::{HlsCodeGenerator, InterfaceBoilerplate, VitisHls, TOP_FUNCTION};

pub trait CodeGen {
    /// Write the generated source, optionally preceded by the plan as a comment.
    fn emit<W: fmt::Write>(&self, include_plan: Option<PlanPrintStyle>, out: &mut W)
        -> fmt::Result;

    fn emit_io<W: io::Write>(&self, include_plan: Option<PlanPrintStyle>, out: W) -> io::Result<()> {
        self.emit(include_plan, &mut ToWriteFmt(out))
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "failed to write generated code"))
    }

    fn emit_string(&self, include_plan: Option<PlanPrintStyle>) -> Result<String, fmt::Error> {
        let mut out = String::new();
        self.emit(include_plan, &mut out)?;
        Ok(out)
    }
}

impl CodeGen for PipelinePlan {
    fn emit<W: fmt::Write>(
        &self,
        include_plan: Option<PlanPrintStyle>,
        out: &mut W,
    ) -> fmt::Result {
        HlsCodeGenerator::new(self).emit(include_plan, out)
    }
}
