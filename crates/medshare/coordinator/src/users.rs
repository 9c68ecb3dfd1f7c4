//! User directory and the "current user" pointer.
//!
//! There is no authentication: logging in means selecting one of the seeded
//! identities. Operations receive an explicit [`Session`]; only the facade
//! resolves it from the stored pointer.

use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use medshare_integrity::{
    validate, DepartmentMembership, DoctorProfile, EntryTypes, PatientProfile, UserDatabase,
    UserProfile, SCHEMA_VERSION,
};
use medshare_shared::{
    require_capability, Capability, MedshareError, MedshareResult, Role, Session, USER_DATABASE,
};
use serde::{Deserialize, Serialize};

use crate::ids::generate_id;
use crate::store::KeyValueStore;
use crate::MedshareBackend;

pub const DEPARTMENTS: [&str; 10] = [
    "心血管科",
    "内科",
    "骨科",
    "神经科",
    "外科",
    "呼吸内科",
    "消化内科",
    "泌尿科",
    "妇产科",
    "儿科",
];

pub const FIRST_HOSPITAL: &str = "浙江大学医学院附属第一医院";
pub const SECOND_HOSPITAL: &str = "浙江大学医学院附属第二医院";

// id, name, phone, id card, department, membership id
#[rustfmt::skip]
const SEED_PATIENTS: [(&str, &str, &str, &str, &str, &str); 4] = [
    ("patient_cardio_001", "张三", "13800138001", "330101199001011234", "心血管科", "dept_cardio_001"),
    ("patient_cardio_002", "李四", "13800138002", "330101199202021234", "心血管科", "dept_cardio_002"),
    ("patient_respiratory_001", "王五", "13800138003", "330101199303031234", "呼吸内科", "dept_respiratory_001"),
    ("patient_respiratory_002", "赵六", "13800138004", "330101199404041234", "呼吸内科", "dept_respiratory_002"),
];

// id, name, phone, id card, department, hospital
#[rustfmt::skip]
const SEED_DOCTORS: [(&str, &str, &str, &str, &str, &str); 4] = [
    ("doctor_cardio_001", "刘医生", "13900139001", "330101197001011234", "心血管科", FIRST_HOSPITAL),
    ("doctor_cardio_002", "陈医生", "13900139002", "330101197502021234", "心血管科", SECOND_HOSPITAL),
    ("doctor_respiratory_001", "吴医生", "13900139003", "330101197603031234", "呼吸内科", FIRST_HOSPITAL),
    ("doctor_respiratory_002", "周医生", "13900139004", "330101197704041234", "呼吸内科", SECOND_HOSPITAL),
];

/// Midnight UTC on 2024-01-01
const SEED_EPOCH: i64 = 1_704_067_200;

fn seed_date(day_offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(SEED_EPOCH + day_offset * 86_400, 0)
        .single()
        .unwrap_or_default()
}

/// Fresh user database: 10 departments, 4 patients, 4 doctors, first
/// patient logged in.
pub fn seed_user_database() -> UserDatabase {
    let patients: Vec<PatientProfile> = SEED_PATIENTS
        .iter()
        .zip(0..)
        .map(|(&(id, name, phone, id_card, department, membership), day)| PatientProfile {
            id: id.to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            id_card: id_card.to_string(),
            gender: None,
            current_department: department.to_string(),
            departments: vec![DepartmentMembership {
                id: membership.to_string(),
                department: department.to_string(),
            }],
            created_at: seed_date(day),
        })
        .collect();

    let doctors: Vec<DoctorProfile> = SEED_DOCTORS
        .iter()
        .zip(4..)
        .map(|(&(id, name, phone, id_card, department, hospital), day)| DoctorProfile {
            id: id.to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            id_card: id_card.to_string(),
            department: department.to_string(),
            hospital: hospital.to_string(),
            created_at: seed_date(day),
        })
        .collect();

    let current_user_id = patients.first().map(|p| p.id.clone());
    UserDatabase {
        version: SCHEMA_VERSION,
        patients,
        doctors,
        departments: DEPARTMENTS.iter().map(|d| d.to_string()).collect(),
        current_user_id,
        current_user_role: Some(Role::Patient),
    }
}

/// Listing for the user switcher
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserListing {
    pub patients: Vec<PatientProfile>,
    pub doctors: Vec<DoctorProfile>,
    pub departments: Vec<String>,
}

impl<S: KeyValueStore> MedshareBackend<S> {
    /// Load the user database, re-seeding it when it is missing or has
    /// fewer patients or doctors than the configured threshold (capped at
    /// the seed size).
    pub fn get_user_database(&mut self) -> MedshareResult<UserDatabase> {
        // A threshold above the seed size would re-seed on every load
        let threshold = self
            .config
            .seed_threshold
            .min(SEED_PATIENTS.len())
            .min(SEED_DOCTORS.len());
        match self.storage.get::<Option<UserDatabase>>(USER_DATABASE, None) {
            Some(db) if db.patients.len() >= threshold && db.doctors.len() >= threshold => Ok(db),
            Some(db) => {
                warn!(
                    "User database incomplete ({} patients, {} doctors); re-seeding",
                    db.patients.len(),
                    db.doctors.len()
                );
                self.reseed_user_database()
            }
            None => {
                info!("No user database found; seeding preset users");
                self.reseed_user_database()
            }
        }
    }

    fn reseed_user_database(&mut self) -> MedshareResult<UserDatabase> {
        let db = seed_user_database();
        self.storage.remove(USER_DATABASE);
        self.save_user_database(&db)?;
        Ok(db)
    }

    fn save_user_database(&mut self, db: &UserDatabase) -> MedshareResult<()> {
        self.storage.set(USER_DATABASE, db)
    }

    /// Point "current user" at `user_id` and return its session
    pub fn switch_user(&mut self, user_id: &str, role: Role) -> MedshareResult<Session> {
        let mut db = self.get_user_database()?;
        let user = db
            .find_user(user_id, role)
            .ok_or_else(|| MedshareError::not_found(format!("{} user {}", role, user_id)))?;

        db.current_user_id = Some(user.id().to_string());
        db.current_user_role = Some(role);
        self.save_user_database(&db)?;

        info!(
            "Switched current user to {} ({}, {})",
            user.name(),
            role,
            user.department()
        );
        Ok(Session::new(user_id, role))
    }

    pub fn current_user(&mut self) -> MedshareResult<UserProfile> {
        let db = self.get_user_database()?;
        match (&db.current_user_id, db.current_user_role) {
            (Some(id), Some(role)) => db.find_user(id, role).ok_or(MedshareError::NotLoggedIn),
            _ => Err(MedshareError::NotLoggedIn),
        }
    }

    pub fn current_session(&mut self) -> MedshareResult<Session> {
        let user = self.current_user()?;
        Ok(Session::new(user.id(), user.role()))
    }

    pub fn get_all_users(&mut self) -> MedshareResult<UserListing> {
        let db = self.get_user_database()?;
        Ok(UserListing {
            patients: db.patients,
            doctors: db.doctors,
            departments: db.departments,
        })
    }

    /// Make `department` the patient's current department, registering it
    /// first if needed. New uploads are stamped with it.
    pub fn switch_department(
        &mut self,
        session: &Session,
        department: &str,
    ) -> MedshareResult<PatientProfile> {
        require_capability(session, Capability::SwitchDepartment)?;

        let mut db = self.get_user_database()?;
        if !db.departments.iter().any(|d| d == department) {
            return Err(MedshareError::Validation(format!(
                "department: unknown department '{}'",
                department
            )));
        }

        let now = self.now();
        let patient = db
            .patients
            .iter_mut()
            .find(|p| p.id == session.user_id)
            .ok_or_else(|| MedshareError::not_found(format!("Patient {}", session.user_id)))?;

        if !patient.is_registered_in(department) {
            patient.departments.push(DepartmentMembership {
                id: generate_id("dept", now),
                department: department.to_string(),
            });
        }
        patient.current_department = department.to_string();

        let updated = patient.clone();
        validate(EntryTypes::User(&UserProfile::Patient(updated.clone()))).into_result()?;
        self.save_user_database(&db)?;

        info!(
            "Patient {} switched to department {}",
            updated.id, department
        );
        Ok(updated)
    }

    /// Wipe every key and start over from the seed data
    pub fn reset_all_data(&mut self) -> MedshareResult<UserDatabase> {
        self.storage.clear();
        let db = self.reseed_user_database()?;
        warn!("All data reset; store re-seeded");
        Ok(db)
    }

    pub(crate) fn patient_for(&mut self, session: &Session) -> MedshareResult<PatientProfile> {
        let db = self.get_user_database()?;
        db.find_patient(&session.user_id)
            .cloned()
            .ok_or_else(|| MedshareError::not_found(format!("Patient {}", session.user_id)))
    }

    pub(crate) fn doctor_for(&mut self, session: &Session) -> MedshareResult<DoctorProfile> {
        let db = self.get_user_database()?;
        db.find_doctor(&session.user_id)
            .cloned()
            .ok_or_else(|| MedshareError::not_found(format!("Doctor {}", session.user_id)))
    }
}
