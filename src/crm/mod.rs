// Entity bindings for the CRM backend.
// Each module pairs cache keys with endpoints and declares the mutations for one entity.

pub mod opportunities;
