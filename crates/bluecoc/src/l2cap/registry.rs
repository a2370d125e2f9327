//! PSM registration table

use std::fmt;

use super::psm::PSM;
use super::types::*;

/// Who may open or accept channels on a PSM, and with which parameters
#[derive(Clone)]
pub struct Registration {
    pub psm: PSM,
    pub roles: RoleMask,
    pub policy: ConnectionPolicy,
    pub config: LeCreditBasedConfig,
    /// Limits how many incoming channels are accepted; all are when unset
    pub accept: Option<AcceptCallback>,
    /// Consulted when the policy requires authorization
    pub authorize: Option<AuthorizeCallback>,
    pub events: CocEventCallback,
}

impl Registration {
    pub fn new(psm: PSM, roles: RoleMask, config: LeCreditBasedConfig, events: CocEventCallback) -> Self {
        Self {
            psm,
            roles,
            policy: ConnectionPolicy::default(),
            config,
            accept: None,
            authorize: None,
            events,
        }
    }

    pub fn with_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_accept<F>(mut self, accept: F) -> Self
    where
        F: Fn(&AcceptRequest) -> u8 + Send + Sync + 'static,
    {
        self.accept = Some(std::sync::Arc::new(accept));
        self
    }

    pub fn with_authorize<F>(mut self, authorize: F) -> Self
    where
        F: Fn(ConnHandle, PSM) -> bool + Send + Sync + 'static,
    {
        self.authorize = Some(std::sync::Arc::new(authorize));
        self
    }

    /// How many of the requested channels the accept callback grants
    pub fn permitted(&self, request: &AcceptRequest) -> u8 {
        match &self.accept {
            Some(accept) => accept(request).min(request.requested),
            None => request.requested,
        }
    }

    /// Whether the authorization requirement (if any) is met on a link
    pub fn authorized(&self, handle: ConnHandle) -> bool {
        if !self.policy.authorization_required {
            return true;
        }

        match &self.authorize {
            Some(authorize) => authorize(handle, self.psm),
            None => false,
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("psm", &self.psm)
            .field("roles", &self.roles)
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish()
    }
}

/// Fixed size table of registrations
#[derive(Debug)]
pub struct RegistrationTable {
    entries: Vec<Option<Registration>>,
}

impl RegistrationTable {
    pub fn new(size: usize) -> Self {
        let size = size.min(u8::MAX as usize + 1);
        Self {
            entries: (0..size).map(|_| None).collect(),
        }
    }

    pub fn register(&mut self, registration: Registration) -> L2capResult<RegistrationId> {
        if !registration.psm.is_valid() {
            return Err(L2capError::InvalidParameter(format!(
                "Invalid LE PSM {}",
                registration.psm
            )));
        }

        if registration.roles.is_empty() {
            return Err(L2capError::InvalidParameter("Empty role mask".into()));
        }

        if !registration.config.validate() {
            return Err(L2capError::InvalidParameter(format!(
                "MTU {} / MPS {} out of range",
                registration.config.mtu, registration.config.mps
            )));
        }

        if self.iter().any(|(_, entry)| entry.psm == registration.psm) {
            return Err(L2capError::PsmAlreadyRegistered(registration.psm));
        }

        let index = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(L2capError::ResourceLimitReached)?;

        self.entries[index] = Some(registration);
        Ok(RegistrationId(index as u8))
    }

    pub fn remove(&mut self, id: RegistrationId) -> Option<Registration> {
        self.entries.get_mut(id.0 as usize)?.take()
    }

    pub fn get(&self, id: RegistrationId) -> Option<&Registration> {
        self.entries.get(id.0 as usize)?.as_ref()
    }

    /// Registration accepting incoming channels for a PSM value
    pub fn find_acceptor(&self, psm: u16) -> Option<(RegistrationId, &Registration)> {
        self.iter()
            .find(|(_, entry)| entry.psm.value() == psm && entry.roles.contains(RoleMask::ACCEPTOR))
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegistrationId, &Registration)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_ref().map(|entry| (RegistrationId(index as u8), entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn events() -> CocEventCallback {
        Arc::new(Mutex::new(|_event: CocEvent| -> L2capResult<()> { Ok(()) }))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut table = RegistrationTable::new(2);

        let id = table
            .register(Registration::new(PSM::EATT, RoleMask::ACCEPTOR, LeCreditBasedConfig::default(), events()))
            .unwrap();
        assert_eq!(table.get(id).unwrap().psm, PSM::EATT);
        assert_eq!(table.find_acceptor(0x0027).map(|(found, _)| found), Some(id));
        assert!(table.find_acceptor(0x0025).is_none());

        // Same PSM twice
        let duplicate = table.register(Registration::new(
            PSM::EATT,
            RoleMask::INITIATOR,
            LeCreditBasedConfig::default(),
            events(),
        ));
        assert!(matches!(duplicate, Err(L2capError::PsmAlreadyRegistered(PSM::EATT))));
    }

    #[test]
    fn test_initiator_only_is_not_an_acceptor() {
        let mut table = RegistrationTable::new(2);
        table
            .register(Registration::new(PSM::OTS, RoleMask::INITIATOR, LeCreditBasedConfig::default(), events()))
            .unwrap();
        assert!(table.find_acceptor(PSM::OTS.value()).is_none());
    }

    #[test]
    fn test_table_full_and_invalid_config() {
        let mut table = RegistrationTable::new(1);
        table
            .register(Registration::new(PSM::IPSP, RoleMask::all(), LeCreditBasedConfig::default(), events()))
            .unwrap();

        let full = table.register(Registration::new(PSM::OTS, RoleMask::all(), LeCreditBasedConfig::default(), events()));
        assert!(matches!(full, Err(L2capError::ResourceLimitReached)));

        let mut table = RegistrationTable::new(1);
        let config = LeCreditBasedConfig {
            mtu: 10,
            ..Default::default()
        };
        let invalid = table.register(Registration::new(PSM::OTS, RoleMask::all(), config, events()));
        assert!(matches!(invalid, Err(L2capError::InvalidParameter(_))));
    }

    #[test]
    fn test_accept_and_authorize_callbacks() {
        let registration = Registration::new(PSM::EATT, RoleMask::ACCEPTOR, LeCreditBasedConfig::default(), events())
            .with_accept(|request| 5u8.saturating_sub(request.open))
            .with_policy(ConnectionPolicy {
                min_security_level: SecurityLevel::None,
                authorization_required: true,
            });

        let request = AcceptRequest {
            handle: 1,
            psm: PSM::EATT,
            requested: 3,
            open: 3,
        };
        assert_eq!(registration.permitted(&request), 2);

        // No authorize callback means no authorization
        assert!(!registration.authorized(1));
        let registration = registration.with_authorize(|handle, _| handle == 1);
        assert!(registration.authorized(1));
        assert!(!registration.authorized(2));
    }
}
