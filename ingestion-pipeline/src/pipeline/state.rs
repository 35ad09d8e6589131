use state_machines::state_machine;

state_machine! {
    name: DocumentMachine,
    state: DocumentState,
    initial: Ready,
    states: [Ready, Chunked, Extracted, Merged, Finalized, Failed],
    events {
        chunk { transition: { from: Ready, to: Chunked } }
        extract { transition: { from: Chunked, to: Extracted } }
        merge { transition: { from: Extracted, to: Merged } }
        finalize { transition: { from: Merged, to: Finalized } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Chunked, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Merged, to: Failed }
        }
    }
}

pub fn ready() -> DocumentMachine<(), Ready> {
    DocumentMachine::new(())
}
