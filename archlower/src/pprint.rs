use crate::lower::{PipelinePlan, Step, Transfer};
use crate::utils::{indent, join_into_string};

use prettytable::{self, format, row, Cell};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PlanPrintStyle {
    Full,
    Compact,
}

/// Pretty-print a [PipelinePlan] to stdout.
pub fn pprint(plan: &PipelinePlan, style: PlanPrintStyle) {
    pprint_table(plan, style).printstd();
    if style == PlanPrintStyle::Full {
        slot_table(plan).printstd();
    }
}

/// Pretty-print a [PipelinePlan] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(
    out: &mut W,
    plan: &PipelinePlan,
    style: PlanPrintStyle,
) -> fmt::Result {
    write!(out, "{}", pprint_table(plan, style))?;
    if style == PlanPrintStyle::Full && !plan.slots.is_empty() {
        writeln!(out)?;
        write!(out, "{}", slot_table(plan))?;
    }
    Ok(())
}

pub fn pprint_string(plan: &PipelinePlan, style: PlanPrintStyle) -> String {
    let mut out = String::new();
    pprint_write(&mut out, plan, style).expect("writing to a String cannot fail");
    out
}

fn pprint_table(plan: &PipelinePlan, style: PlanPrintStyle) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    let titles = match style {
        PlanPrintStyle::Full => row!["Step", "Operator", "Reads", "Writes", "Shape"],
        PlanPrintStyle::Compact => row!["Pipeline"],
    };
    table.set_titles(titles);

    if let Some(load) = &plan.load {
        table.add_row(transfer_row(load, "load", style));
    }
    for step in &plan.steps {
        table.add_row(step_row(step, style));
    }
    table.add_row(transfer_row(&plan.store, "store", style));

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

fn step_row(step: &Step, style: PlanPrintStyle) -> prettytable::Row {
    let reads = join_into_string(&step.inputs, ", ");
    let shapes = join_into_string(&step.input_shapes, ", ");
    match style {
        PlanPrintStyle::Full => {
            let mut r = row![step.index, step.params, reads];
            r.add_cell(Cell::new(&step.output.to_string()));
            r.add_cell(Cell::new(&format!("{shapes} -> {}", step.output_shape)));
            r
        }
        PlanPrintStyle::Compact => row![format!(
            "{}{} = {}({reads})  /* {} */",
            indent(1),
            step.output,
            step.params,
            step.output_shape
        )],
    }
}

fn transfer_row(transfer: &Transfer, label: &str, style: PlanPrintStyle) -> prettytable::Row {
    match style {
        PlanPrintStyle::Full => row![
            "",
            label,
            transfer.from,
            transfer.to,
            transfer.shape
        ],
        PlanPrintStyle::Compact => row![format!(
            "{} = {label}({})  /* {} */",
            transfer.to, transfer.from, transfer.shape
        )],
    }
}

fn slot_table(plan: &PipelinePlan) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Slot", "Capacity", "Live Until", "Retained"]);
    let retained = plan.retained_slots();
    for slot in &plan.slots {
        let mark = if retained.contains(&slot.id) { "yes" } else { "" };
        table.add_row(row![slot.id, slot.capacity, slot.live_until, mark]);
    }
    table.set_format(*format::consts::FORMAT_CLEAN);
    table
}
