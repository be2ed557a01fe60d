use std::io::Write;

use serde::Serialize;

use crate::error::SimError;
use crate::network::Network;
use crate::simulation::Time;

/// One accepted request as seen by its initiating application.
#[derive(Debug, Serialize)]
struct RequestRow<'a> {
    #[serde(rename = "Initiator")]
    initiator: &'a str,
    #[serde(rename = "Responder")]
    responder: &'a str,
    #[serde(rename = "Start_time")]
    start_time: Time,
    #[serde(rename = "End_time")]
    end_time: Time,
    #[serde(rename = "Memory_size")]
    memory_size: usize,
    #[serde(rename = "Fidelity")]
    fidelity: f64,
    #[serde(rename = "Wait_time")]
    wait_time: Time,
    #[serde(rename = "Throughput")]
    throughput: f64,
}

/// One committed reservation window at one node.
#[derive(Debug, Serialize)]
struct MemoryRow<'a> {
    #[serde(rename = "Node")]
    node: &'a str,
    #[serde(rename = "Start_time")]
    start_time: Time,
    #[serde(rename = "End_time")]
    end_time: Time,
    #[serde(rename = "Memory_size")]
    memory_size: usize,
}

/// Per-request metrics CSV: one row per accepted reservation that also
/// finished its window, joined with the application's wait-time and
/// throughput series.
pub fn write_request_csv<W: Write>(network: &Network, writer: W) -> Result<(), SimError> {
    let mut csv = csv::Writer::from_writer(writer);
    for node in &network.nodes {
        let Some(state) = node.try_router() else {
            continue;
        };
        let Some(app) = state.app.as_ref() else {
            continue;
        };
        let wait_times = app.get_wait_time();
        let throughputs = app.get_throughput();
        let rows = app
            .reserves
            .len()
            .min(wait_times.len())
            .min(throughputs.len());
        for i in 0..rows {
            let record = &app.reserves[i];
            csv.serialize(RequestRow {
                initiator: &node.name,
                responder: &record.responder,
                start_time: record.start_time,
                end_time: record.end_time,
                memory_size: record.memory_size,
                fidelity: record.target_fidelity,
                wait_time: wait_times[i],
                throughput: throughputs[i],
            })?;
        }
    }
    csv.flush()?;
    Ok(())
}

/// Per-node memory usage CSV: every committed reservation window at every
/// router.
pub fn write_memory_usage_csv<W: Write>(network: &Network, writer: W) -> Result<(), SimError> {
    let mut csv = csv::Writer::from_writer(writer);
    for node in &network.nodes {
        let Some(state) = node.try_router() else {
            continue;
        };
        for accepted in &state.manager.reservation.accepted {
            csv.serialize(MemoryRow {
                node: &node.name,
                start_time: accepted.reservation.start_time,
                end_time: accepted.reservation.end_time,
                memory_size: accepted.reservation.memory_size,
            })?;
        }
    }
    csv.flush()?;
    Ok(())
}
