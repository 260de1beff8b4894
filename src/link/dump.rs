//! Text dump of a link and its loaded children, used in severe-error diagnostics.

use std::fmt::{self, Write};

use super::Link;
use crate::stats::StatsSnapshot;
use crate::tuple::Tuple;

fn opt<T: fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn write_tuple(out: &mut String, pad: &str, tuple: &Tuple) -> fmt::Result {
    writeln!(
        out,
        "{pad}  <tuple stream=\"{}\" type=\"{}\" strategy=\"{}\" priority=\"{}\" sequence=\"{}\" \
         persistent-size=\"{}\" expiry=\"{}\" delivery-delay=\"{}\" redelivered=\"{}\" \
         referred=\"{}\" deleted=\"{}\"/>",
        tuple.stream_id,
        tuple.type_name,
        tuple.strategy,
        tuple.priority,
        tuple.sequence,
        tuple.persistent_size,
        opt(tuple.expiry_time),
        opt(tuple.delivery_delay_time),
        tuple.redelivered_count,
        opt(tuple.referred_id),
        tuple.logically_deleted,
    )
}

fn write_stats(out: &mut String, pad: &str, stats: &StatsSnapshot) -> fmt::Result {
    writeln!(
        out,
        "{pad}  <statistics total=\"{}\" bytes=\"{}\" available=\"{}\" locked=\"{}\" adding=\"{}\" \
         removing=\"{}\" updating=\"{}\" expiring=\"{}\" spilling=\"{}\"/>",
        stats.total_count,
        stats.total_bytes,
        stats.available_count,
        stats.locked_count,
        stats.adding_count,
        stats.removing_count,
        stats.updating_count,
        stats.expiring_count,
        stats.spilling,
    )
}

impl Link {
    /// Renders this link and its loaded children as nested tagged text.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_dump(&mut out, 0);
        out
    }

    fn write_dump(&self, out: &mut String, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        let tag = self.kind().tag();
        let (state, backouts, unlocks, lock, tran, strong, tuple) = {
            let st = self.lock_state();
            (
                st.state,
                st.backout_count,
                st.unlock_count,
                st.lock_id,
                st.tran_id,
                st.strong.label(),
                st.tuple.clone(),
            )
        };
        writeln!(
            out,
            "{pad}<{tag} id=\"{}\" state=\"{state}\" size=\"{}\" backouts=\"{backouts}\" \
             unlocks=\"{unlocks}\" lock=\"{lock}\" tran=\"{}\" payload=\"{strong}\" cached=\"{}\">",
            self.id(),
            self.in_memory_size(),
            opt(tran),
            self.is_cache_managed(),
        )?;
        write_tuple(out, &pad, &tuple)?;
        if let Some(count) = self.reference_count() {
            writeln!(out, "{pad}  <references count=\"{count}\"/>")?;
        }
        if let Some(stats) = self.statistics() {
            write_stats(out, &pad, &stats)?;
        }
        for child in self.loaded_children() {
            child.write_dump(out, depth + 1)?;
        }
        writeln!(out, "{pad}</{tag}>")
    }
}
