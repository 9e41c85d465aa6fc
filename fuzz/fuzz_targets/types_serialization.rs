#![no_main]

use libfuzzer_sys::fuzz_target;
use voratiq_core::types::{AgentInvocationRecord, RunRecord, RunReport};

fuzz_target!(|data: &[u8]| {
    // Try to parse as JSON and verify serialization roundtrips for every
    // persisted document shape.
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(record) = serde_json::from_str::<RunRecord>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&record) {
            if let Ok(parsed) = serde_json::from_str::<RunRecord>(&roundtripped) {
                assert_eq!(record.run_id, parsed.run_id);
                assert_eq!(record.agents.len(), parsed.agents.len());
            }
        }
    }

    if let Ok(agent) = serde_json::from_str::<AgentInvocationRecord>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&agent) {
            if let Ok(parsed) = serde_json::from_str::<AgentInvocationRecord>(&roundtripped) {
                assert_eq!(agent.agent_id, parsed.agent_id);
                assert_eq!(agent.status, parsed.status);
            }
        }
    }

    if let Ok(report) = serde_json::from_str::<RunReport>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&report) {
            if let Ok(parsed) = serde_json::from_str::<RunReport>(&roundtripped) {
                assert_eq!(report.run_id, parsed.run_id);
            }
        }
    }
});
