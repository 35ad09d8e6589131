use state_machines::state_machine;

state_machine! {
    name: QueryMachine,
    state: QueryState,
    initial: Received,
    states: [Received, KeywordsExtracted, Retrieved, Truncated, Merged, ContextBuilt, Answered, Bypassed, Failed],
    events {
        extract_keywords { transition: { from: Received, to: KeywordsExtracted } }
        retrieve { transition: { from: KeywordsExtracted, to: Retrieved } }
        truncate { transition: { from: Retrieved, to: Truncated } }
        merge_chunks { transition: { from: Truncated, to: Merged } }
        build_context { transition: { from: Merged, to: ContextBuilt } }
        answer { transition: { from: ContextBuilt, to: Answered } }
        bypass { transition: { from: Received, to: Bypassed } }
        fail {
            transition: { from: Received, to: Failed }
            transition: { from: KeywordsExtracted, to: Failed }
            transition: { from: Retrieved, to: Failed }
            transition: { from: Truncated, to: Failed }
            transition: { from: Merged, to: Failed }
            transition: { from: ContextBuilt, to: Failed }
        }
    }
}

pub fn received() -> QueryMachine<(), Received> {
    QueryMachine::new(())
}
