// Tests module
// Scenario tests across components:
// - aggregation: votes and timeouts from a real committee into QCs and TCs
// - validation: adversarial proposals, votes, timeouts and certificates
// - safety_rules: voting and timeout rules with persisted safety data
// - round_robin: the coldstuff loop against recording and in-process peers


pub mod round_robin;
